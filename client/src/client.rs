use crate::{backoff, events::FeedConfig, Error, Result};
use reqwest::{header::HeaderMap, Method, StatusCode};
use serde::de::DeserializeOwned;
use std::time::Duration;
use tracing::{debug, warn};
use unobot_types::api::{
    ActionAck, Command, CreateRoomRequest, CreateRoomResponse, JoinRequest, JoinResponse, PlayerId,
    RoomId, RoomListing, RoomSnapshot,
};
use url::Url;

/// Header carrying the bot's hardware address on every request.
pub const MAC_HEADER: &str = "X-MAC-Address";

const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Retry behavior for gateway requests.
///
/// Idempotent requests are retried on 5xx and transport errors. Every request
/// is retried on 429. Other POSTs are only retried on 5xx when
/// `retry_non_idempotent` is set.
#[derive(Clone, Debug)]
pub struct RetryPolicy {
    pub max_attempts: usize,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    pub retry_non_idempotent: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_backoff: Duration::from_millis(250),
            max_backoff: Duration::from_secs(5),
            retry_non_idempotent: false,
        }
    }
}

/// Request/response gateway to the game server.
#[derive(Clone)]
pub struct Client {
    pub(crate) base_url: Url,
    http: reqwest::Client,
    mac_address: String,
    retry_policy: RetryPolicy,
}

impl Client {
    pub fn new(base_url: &str, mac_address: impl Into<String>) -> Result<Self> {
        let mut base_url = Url::parse(base_url)?;
        match base_url.scheme() {
            "http" | "https" => {}
            other => return Err(Error::InvalidScheme(other.to_string())),
        }
        // Relative joins replace the last path segment unless it ends in '/'.
        if !base_url.path().ends_with('/') {
            let path = format!("{}/", base_url.path());
            base_url.set_path(&path);
        }
        let http = reqwest::Client::builder()
            .timeout(DEFAULT_REQUEST_TIMEOUT)
            .build()?;
        Ok(Self {
            base_url,
            http,
            mac_address: mac_address.into(),
            retry_policy: RetryPolicy::default(),
        })
    }

    pub fn with_retry_policy(mut self, retry_policy: RetryPolicy) -> Self {
        self.retry_policy = retry_policy;
        self
    }

    pub fn retry_policy(&self) -> &RetryPolicy {
        &self.retry_policy
    }

    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    pub fn mac_address(&self) -> &str {
        &self.mac_address
    }

    fn room_url(&self, room: &RoomId, tail: &str) -> Result<Url> {
        let path = if tail.is_empty() {
            format!("rooms/{room}")
        } else {
            format!("rooms/{room}/{tail}")
        };
        Ok(self.base_url.join(&path)?)
    }

    pub(crate) async fn get_with_retry(&self, url: Url) -> Result<reqwest::Response> {
        self.send_with_retry(Method::GET, url, None).await
    }

    pub(crate) async fn post_json_with_retry(
        &self,
        url: Url,
        body: &serde_json::Value,
    ) -> Result<reqwest::Response> {
        self.send_with_retry(Method::POST, url, Some(body)).await
    }

    async fn send_with_retry(
        &self,
        method: Method,
        url: Url,
        body: Option<&serde_json::Value>,
    ) -> Result<reqwest::Response> {
        let policy = &self.retry_policy;
        let idempotent = method == Method::GET;
        let max_attempts = policy.max_attempts.max(1);
        let mut backoff = policy.initial_backoff;
        let mut attempt = 0;
        loop {
            attempt += 1;
            let mut request = self
                .http
                .request(method.clone(), url.clone())
                .header(MAC_HEADER, &self.mac_address);
            if let Some(body) = body {
                request = request.json(body);
            }

            let delay = match request.send().await {
                Ok(response) if response.status().is_success() => return Ok(response),
                Ok(response) => {
                    let status = response.status();
                    let retry_after = retry_after(response.headers());
                    let retryable = status == StatusCode::TOO_MANY_REQUESTS
                        || (status.is_server_error()
                            && (idempotent || policy.retry_non_idempotent));
                    if !retryable || attempt >= max_attempts {
                        let text = response.text().await.unwrap_or_default();
                        return Err(classify(status, retry_after, &method, &url, text));
                    }
                    warn!(%method, %url, %status, attempt, "request failed, retrying");
                    match retry_after {
                        Some(wait) if status == StatusCode::TOO_MANY_REQUESTS => wait,
                        _ => jitter(backoff),
                    }
                }
                Err(err) => {
                    // A refused connection never reached the server.
                    let retryable =
                        idempotent || policy.retry_non_idempotent || err.is_connect();
                    if !retryable || attempt >= max_attempts {
                        return Err(err.into());
                    }
                    warn!(%method, %url, attempt, error = %err, "request error, retrying");
                    jitter(backoff)
                }
            };
            tokio::time::sleep(delay).await;
            backoff = backoff::next_backoff(backoff, policy.max_backoff);
        }
    }

    async fn decode<T: DeserializeOwned>(response: reqwest::Response) -> Result<T> {
        let text = response.text().await?;
        Ok(serde_json::from_str(&text)?)
    }

    pub async fn list_rooms(&self) -> Result<Vec<RoomListing>> {
        let url = self.base_url.join("rooms/list")?;
        let response = self.get_with_retry(url).await?;
        Self::decode(response).await
    }

    pub async fn create_room(&self, is_sandbox: bool) -> Result<RoomId> {
        let url = self.base_url.join("rooms")?;
        let body = serde_json::to_value(CreateRoomRequest { is_sandbox })?;
        let response = self.post_json_with_retry(url, &body).await?;
        let created: CreateRoomResponse = Self::decode(response).await?;
        debug!(room = %created.room_id, "created room");
        Ok(created.room_id)
    }

    pub async fn join(&self, room: &RoomId, request: &JoinRequest) -> Result<PlayerId> {
        let url = self.room_url(room, "join")?;
        let body = serde_json::to_value(request)?;
        let response = self.post_json_with_retry(url, &body).await?;
        let joined: JoinResponse = Self::decode(response).await?;
        Ok(joined.player_id)
    }

    /// Full room state as seen by `player`.
    pub async fn room_state(&self, room: &RoomId, player: &PlayerId) -> Result<RoomSnapshot> {
        let mut url = self.room_url(room, "")?;
        url.query_pairs_mut()
            .append_pair("playerId", player.as_str());
        let response = self.get_with_retry(url).await?;
        Self::decode(response).await
    }

    /// Submit one action. An empty success body is treated as a bare acknowledgment.
    pub async fn submit(
        &self,
        room: &RoomId,
        player: &PlayerId,
        command: &Command,
    ) -> Result<ActionAck> {
        let url = self.room_url(room, command.endpoint())?;
        let body = command.body(player);
        debug!(%room, %command, "submitting action");
        let response = self.post_json_with_retry(url, &body).await?;
        let text = response.text().await?;
        if text.trim().is_empty() {
            return Ok(ActionAck::default());
        }
        let ack: ActionAck = serde_json::from_str(&text)?;
        if ack.success == Some(false) {
            return Err(Error::Rejected {
                status: StatusCode::OK,
                body: text,
            });
        }
        Ok(ack)
    }

    pub async fn leave(&self, room: &RoomId, player: &PlayerId) -> Result<()> {
        let url = self.room_url(room, "leave")?;
        let body = serde_json::json!({ "playerId": player });
        self.post_json_with_retry(url, &body).await?;
        Ok(())
    }

    /// Feed settings pointed at `socket_url` for this room and player.
    pub fn feed_config(
        &self,
        socket_url: &str,
        room: RoomId,
        player: PlayerId,
    ) -> Result<FeedConfig> {
        Ok(FeedConfig::new(websocket_url(socket_url)?, room, player))
    }
}

/// Map http(s) to ws(s); ws(s) URLs pass through.
pub fn websocket_url(raw: &str) -> Result<Url> {
    let mut url = Url::parse(raw)?;
    let scheme = match url.scheme() {
        "http" => "ws",
        "https" => "wss",
        "ws" | "wss" => return Ok(url),
        other => return Err(Error::InvalidScheme(other.to_string())),
    };
    url.set_scheme(scheme)
        .map_err(|()| Error::InvalidScheme(raw.to_string()))?;
    Ok(url)
}

fn jitter(backoff: Duration) -> Duration {
    backoff::jittered_backoff(&mut rand::thread_rng(), backoff)
}

fn retry_after(headers: &HeaderMap) -> Option<Duration> {
    headers
        .get(reqwest::header::RETRY_AFTER)?
        .to_str()
        .ok()?
        .trim()
        .parse::<u64>()
        .ok()
        .map(Duration::from_secs)
}

fn classify(
    status: StatusCode,
    retry_after: Option<Duration>,
    method: &Method,
    url: &Url,
    text: String,
) -> Error {
    match status {
        StatusCode::TOO_MANY_REQUESTS => Error::RateLimited { retry_after },
        StatusCode::NOT_FOUND => Error::RoomNotFound,
        StatusCode::FORBIDDEN => Error::Forbidden(text),
        StatusCode::UNAUTHORIZED => Error::Unauthorized,
        status if status.is_client_error() => Error::Rejected { status, body: text },
        status => Error::FailedWithBody {
            status,
            body: format!("{method} {url} failed: {text}"),
        },
    }
}
