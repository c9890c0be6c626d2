//! Turn lifecycle for one seat in one room.
//!
//! The coordinator is the only writer of the [TableState]. It multiplexes the
//! event feed, the pending strategy decision, the single in-flight request and
//! that request's watchdog in one loop, so every change to the table happens on
//! one task in the order it was observed.

use crate::{
    error::SessionError,
    gateway::Gateway,
    legality,
    reconcile::{Reconciler, Signal},
    recovery::PointerStore,
    strategy::{Action, Deadline, Strategy, StrategyError},
    summary::{SummarySink, Tally, TracingSink},
    table::{TableState, TableView, WindowKind},
};
use futures::{Stream, StreamExt};
use std::{future, sync::Arc, time::Duration};
use tokio::{
    task::JoinHandle,
    time::{sleep, sleep_until, timeout_at, Instant},
};
use tracing::{debug, info, warn};
use unobot_client::{Error as ClientError, FeedEvent};
use unobot_types::{
    ActionAck, ActionNotice, Card, Command, GameEnd, GameSummary, PlayerId, RoomId, RoomSnapshot,
    RoomStatus, SessionPointer, TurnSequence,
};

#[derive(Clone, Debug)]
pub struct CoordinatorConfig {
    /// Server turn timer; `None` in practice mode.
    pub turn_timeout: Option<Duration>,
    /// Subtracted from the turn timer to leave room for submission.
    pub decision_margin: Duration,
    /// How long a submitted action may go unacknowledged.
    pub ack_watchdog: Duration,
    pub auto_catchout: bool,
    pub max_resync_attempts: u32,
    pub resync_backoff: Duration,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            turn_timeout: Some(Duration::from_secs(15)),
            decision_margin: Duration::from_millis(500),
            ack_watchdog: Duration::from_secs(4),
            auto_catchout: true,
            max_resync_attempts: 5,
            resync_backoff: Duration::from_millis(250),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Phase {
    Idle,
    Deciding,
    Submitting,
    AwaitingAck,
    /// Our Wild Draw Four is open to challenge.
    ChallengeWait,
}

#[derive(Clone, Debug, PartialEq)]
pub enum SessionOutcome {
    GameOver(GameSummary),
    /// The room ended without a `gameEnd` reaching us.
    RoomEnded,
}

struct Decision {
    handle: JoinHandle<Result<Action, StrategyError>>,
    deadline: Option<Instant>,
    view: TableView,
}

impl Decision {
    async fn wait(&mut self) -> Result<Action, StrategyError> {
        let joined = match self.deadline {
            Some(deadline) => match timeout_at(deadline, &mut self.handle).await {
                Ok(joined) => joined,
                Err(_) => return Err(StrategyError::Timeout),
            },
            None => (&mut self.handle).await,
        };
        joined.unwrap_or_else(|err| Err(StrategyError::Internal(err.to_string())))
    }
}

/// A play held back until the UNO call ahead of it settles.
struct Queued {
    command: Command,
    card: Option<Card>,
    hand: Vec<Card>,
}

struct InFlight {
    handle: JoinHandle<Result<ActionAck, ClientError>>,
    command: Command,
    card: Option<Card>,
    queued: Option<Queued>,
    base_seq: TurnSequence,
    base_hand: usize,
    watchdog: Instant,
    resubmitted: bool,
}

impl InFlight {
    /// Stop the request and wait until it can no longer reach the server.
    async fn cancel(&mut self) -> Option<Result<ActionAck, ClientError>> {
        self.handle.abort();
        (&mut self.handle).await.ok()
    }

    /// The room moved past our request in a way only the request explains.
    fn applied_in(&self, snapshot: &RoomSnapshot, me: &PlayerId) -> bool {
        snapshot.turn_sequence > self.base_seq
            && (snapshot.current_player_id.as_ref() != Some(me)
                || snapshot.hand.len() != self.base_hand)
    }
}

async fn wait_decision(decision: Option<&mut Decision>) -> Result<Action, StrategyError> {
    match decision {
        Some(decision) => decision.wait().await,
        None => future::pending().await,
    }
}

async fn wait_request(
    flight: Option<&mut InFlight>,
) -> Result<Result<ActionAck, ClientError>, tokio::task::JoinError> {
    match flight {
        Some(flight) => (&mut flight.handle).await,
        None => future::pending().await,
    }
}

async fn wait_watchdog(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => sleep_until(deadline).await,
        None => future::pending().await,
    }
}

pub struct Coordinator<G: Gateway> {
    gateway: G,
    room: RoomId,
    config: CoordinatorConfig,
    strategy: Arc<dyn Strategy>,
    table: TableState,
    reconciler: Reconciler,
    tally: Tally,
    store: Option<PointerStore>,
    sink: Box<dyn SummarySink>,
    phase: Phase,
    connected: bool,
    decision: Option<Decision>,
    in_flight: Option<InFlight>,
    /// Last turn sequence a decision was started for.
    decided_at: Option<TurnSequence>,
    /// Failed submissions at one turn sequence.
    failures: Option<(TurnSequence, u32)>,
    /// Catchout windows already acted on, keyed by where they opened.
    catchout_sent: Option<TurnSequence>,
}

impl<G: Gateway> Coordinator<G> {
    pub fn new(
        gateway: G,
        room: RoomId,
        table: TableState,
        strategy: Arc<dyn Strategy>,
        config: CoordinatorConfig,
    ) -> Self {
        let tally = Tally::new(room.clone(), table.me().clone(), strategy.name());
        Self {
            gateway,
            room,
            config,
            strategy,
            table,
            reconciler: Reconciler::default(),
            tally,
            store: None,
            sink: Box::new(TracingSink),
            phase: Phase::Idle,
            connected: false,
            decision: None,
            in_flight: None,
            decided_at: None,
            failures: None,
            catchout_sent: None,
        }
    }

    pub fn with_store(mut self, store: PointerStore) -> Self {
        self.store = Some(store);
        self
    }

    pub fn with_sink(mut self, sink: impl SummarySink + 'static) -> Self {
        self.sink = Box::new(sink);
        self
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn table(&self) -> &TableState {
        &self.table
    }

    /// Play until the game ends or the session cannot continue.
    pub async fn run<S>(mut self, mut feed: S) -> Result<SessionOutcome, SessionError>
    where
        S: Stream<Item = FeedEvent> + Unpin,
    {
        info!(
            room = %self.room,
            player = %self.table.me(),
            strategy = self.strategy.name(),
            "session started"
        );
        loop {
            if self.table.is_stale() {
                if let Some(outcome) = self.resync(&mut feed).await? {
                    return Ok(outcome);
                }
                continue;
            }
            self.advance();

            let watchdog = self.in_flight.as_ref().map(|flight| flight.watchdog);
            let step = tokio::select! {
                event = feed.next() => {
                    let Some(event) = event else {
                        return Err(SessionError::TransportExhausted(
                            "event feed closed".to_string(),
                        ));
                    };
                    let signal = self.reconciler.on_feed(&mut self.table, event);
                    self.on_signal(signal).await?
                }
                result = wait_decision(self.decision.as_mut()) => {
                    self.on_decision(result);
                    None
                }
                joined = wait_request(self.in_flight.as_mut()) => {
                    let result = joined.unwrap_or_else(|err| {
                        warn!(%err, "request task failed");
                        Err(ClientError::ConnectionClosed)
                    });
                    match self.in_flight.take() {
                        Some(flight) => self.finish_request(flight, result).await?,
                        None => None,
                    }
                }
                _ = wait_watchdog(watchdog) => self.on_watchdog().await?,
            };
            if let Some(outcome) = step {
                return Ok(outcome);
            }
        }
    }

    fn set_phase(&mut self, phase: Phase) {
        if self.phase != phase {
            debug!(from = ?self.phase, to = ?phase, seq = ?self.table.last_applied(), "phase");
            self.phase = phase;
        }
    }

    /// Start whatever the table now calls for, if nothing is pending.
    fn advance(&mut self) {
        if self.in_flight.is_some() || self.decision.is_some() {
            return;
        }
        if self.phase == Phase::ChallengeWait && !self.our_wild_draw_four_open() {
            self.set_phase(Phase::Idle);
        }
        if self.table.is_stale() || !self.table.in_game() {
            return;
        }
        if self.config.auto_catchout && self.try_catchout() {
            return;
        }
        if self.table.is_my_turn() {
            self.start_decision();
        }
    }

    fn our_wild_draw_four_open(&self) -> bool {
        self.table.window().is_some_and(|window| {
            window.kind == WindowKind::WildDrawFourChallenge && &window.target == self.table.me()
        })
    }

    fn try_catchout(&mut self) -> bool {
        let Some(window) = self.table.window() else {
            return false;
        };
        if window.kind != WindowKind::UnoCatchout
            || &window.target == self.table.me()
            || self.catchout_sent == Some(window.opened_at)
        {
            return false;
        }
        let target = window.target.clone();
        self.catchout_sent = Some(window.opened_at);
        info!(%target, seq = window.opened_at, "catching out missed UNO call");
        self.send(Command::Catchout { target }, None, None);
        true
    }

    fn start_decision(&mut self) {
        let Some(view) = self.table.snapshot() else {
            return;
        };
        let seq = view.turn_sequence;
        if self.decided_at == Some(seq) {
            return;
        }
        self.decided_at = Some(seq);
        match self.failures {
            Some((at, count)) if at == seq && count >= 2 => {
                warn!(seq, "repeated failures this turn, waiting for the server to move on");
                return;
            }
            Some((at, _)) if at == seq => {
                let action = legality::fallback(&view);
                info!(seq, ?action, "retrying turn with the fallback action");
                self.submit_action(view, action);
                return;
            }
            _ => {}
        }

        let deadline = self
            .config
            .turn_timeout
            .map(|timeout| Instant::now() + timeout.saturating_sub(self.config.decision_margin));
        let strategy = Arc::clone(&self.strategy);
        let task_view = view.clone();
        let strategy_deadline = deadline
            .map(|deadline| Deadline::at(deadline.into_std()))
            .unwrap_or_else(Deadline::unbounded);
        let handle =
            tokio::task::spawn_blocking(move || strategy.decide(&task_view, strategy_deadline));
        self.decision = Some(Decision {
            handle,
            deadline,
            view,
        });
        self.set_phase(Phase::Deciding);
    }

    /// Drop a pending decision the table no longer supports.
    fn check_decision(&mut self) {
        let Some(decision) = &self.decision else {
            return;
        };
        if self.table.is_my_turn() && self.table.hand() == decision.view.hand.as_slice() {
            return;
        }
        warn!(
            seq = decision.view.turn_sequence,
            "turn moved on while deciding, discarding decision"
        );
        // Dropping the handle detaches the strategy; its answer is never used.
        self.decision = None;
        self.set_phase(Phase::Idle);
    }

    fn on_decision(&mut self, result: Result<Action, StrategyError>) {
        let Some(decision) = self.decision.take() else {
            return;
        };
        if !self.table.is_my_turn() || self.table.hand() != decision.view.hand.as_slice() {
            self.set_phase(Phase::Idle);
            return;
        }
        let view = self.table.snapshot().unwrap_or(decision.view);
        let action = match result {
            Ok(action) => action,
            Err(err) => {
                warn!(strategy = self.strategy.name(), %err, "strategy failed, using fallback");
                legality::fallback(&view)
            }
        };
        self.submit_action(view, action);
    }

    fn submit_action(&mut self, view: TableView, action: Action) {
        let command = match legality::check(&view, &action) {
            Ok(command) => command,
            Err(illegal) => {
                warn!(
                    strategy = self.strategy.name(),
                    ?action,
                    %illegal,
                    "illegal action, using fallback"
                );
                match legality::check(&view, &legality::fallback(&view)) {
                    Ok(command) => command,
                    Err(err) => {
                        warn!(%err, "fallback is not legal either, waiting");
                        self.set_phase(Phase::Idle);
                        return;
                    }
                }
            }
        };
        let card = match &command {
            Command::Play { index, .. } => view.hand.get(*index).copied(),
            _ => None,
        };
        if legality::needs_uno_call(&view, &command) {
            debug!(%command, hand = view.hand.len(), "calling UNO ahead of the play");
            let queued = Queued {
                command,
                card,
                hand: view.hand,
            };
            self.send(Command::CallUno, None, Some(queued));
        } else {
            self.send(command, card, None);
        }
    }

    fn send(&mut self, command: Command, card: Option<Card>, queued: Option<Queued>) {
        self.set_phase(Phase::Submitting);
        let handle = self.spawn_request(command.clone());
        info!(%command, seq = ?self.table.last_applied(), "submitting");
        self.in_flight = Some(InFlight {
            handle,
            command,
            card,
            queued,
            base_seq: self.table.last_applied().unwrap_or_default(),
            base_hand: self.table.hand().len(),
            watchdog: Instant::now() + self.config.ack_watchdog,
            resubmitted: false,
        });
        self.set_phase(Phase::AwaitingAck);
    }

    fn spawn_request(&self, command: Command) -> JoinHandle<Result<ActionAck, ClientError>> {
        let gateway = self.gateway.clone();
        let room = self.room.clone();
        let me = self.table.me().clone();
        tokio::spawn(async move { gateway.submit(&room, &me, &command).await })
    }

    fn send_queued(&mut self, queued: Queued) {
        if self.table.is_stale()
            || !self.table.is_my_turn()
            || self.table.hand() != queued.hand.as_slice()
        {
            warn!(command = %queued.command, "turn changed before the play went out, dropping it");
            self.set_phase(Phase::Idle);
            return;
        }
        self.send(queued.command, queued.card, None);
    }

    /// Bookkeeping once the server has our action, by ack or by feed.
    fn settle(&mut self, flight: InFlight, seq: Option<TurnSequence>) {
        if matches!(flight.command, Command::Play { .. } | Command::Draw) {
            self.save_pointer(seq);
        }
        if let Some(queued) = flight.queued {
            self.send_queued(queued);
            return;
        }
        if self.our_wild_draw_four_open() {
            self.set_phase(Phase::ChallengeWait);
        } else {
            self.set_phase(Phase::Idle);
        }
    }

    async fn finish_request(
        &mut self,
        flight: InFlight,
        result: Result<ActionAck, ClientError>,
    ) -> Result<Option<SessionOutcome>, SessionError> {
        match result {
            Ok(ack) => {
                info!(command = %flight.command, seq = ?ack.turn_sequence, "acknowledged");
                let signal =
                    self.reconciler
                        .fold_ack(&mut self.table, &flight.command, flight.card, &ack);
                let outcome = self.on_signal(signal).await?;
                if outcome.is_none() {
                    self.settle(flight, ack.turn_sequence);
                }
                Ok(outcome)
            }
            Err(err) => {
                self.fail(flight, err)?;
                Ok(None)
            }
        }
    }

    fn fail(&mut self, flight: InFlight, err: ClientError) -> Result<(), SessionError> {
        if err.is_fatal() {
            return Err(SessionError::from_client(err));
        }
        if let Some(queued) = flight.queued {
            warn!(%err, "UNO call failed, playing anyway");
            self.send_queued(queued);
            return Ok(());
        }
        if matches!(flight.command, Command::Catchout { .. }) {
            warn!(command = %flight.command, %err, "catchout refused");
            self.set_phase(Phase::Idle);
            return Ok(());
        }
        if err.is_rejection() {
            warn!(command = %flight.command, %err, "server rejected action, resyncing");
        } else {
            warn!(command = %flight.command, %err, "action failed, resyncing");
        }
        self.note_failure(flight.base_seq);
        self.table.mark_stale();
        Ok(())
    }

    fn note_failure(&mut self, seq: TurnSequence) {
        let count = match self.failures {
            Some((at, count)) if at == seq => count + 1,
            _ => 1,
        };
        self.failures = Some((seq, count));
        self.decided_at = None;
    }

    async fn on_watchdog(&mut self) -> Result<Option<SessionOutcome>, SessionError> {
        let Some(mut flight) = self.in_flight.take() else {
            return Ok(None);
        };
        if let Some(result) = flight.cancel().await {
            // Completed just as the watchdog fired.
            return self.finish_request(flight, result).await;
        }
        if let Some(queued) = flight.queued.take() {
            warn!("UNO call unacknowledged, playing anyway");
            self.send_queued(queued);
            return Ok(None);
        }
        if matches!(flight.command, Command::Catchout { .. }) {
            warn!(command = %flight.command, "catchout unacknowledged, dropping it");
            self.set_phase(Phase::Idle);
            return Ok(None);
        }
        if flight.resubmitted {
            warn!(command = %flight.command, "resubmitted action unacknowledged, resyncing");
            self.note_failure(flight.base_seq);
            self.table.mark_stale();
            return Ok(None);
        }

        warn!(
            command = %flight.command,
            watchdog_ms = self.config.ack_watchdog.as_millis() as u64,
            "no acknowledgment in time, checking room state"
        );
        let me = self.table.me().clone();
        let snapshot = match self.gateway.room_state(&self.room, &me).await {
            Ok(snapshot) => snapshot,
            Err(err) if err.is_fatal() => return Err(SessionError::from_client(err)),
            Err(err) => {
                warn!(%err, "room state unavailable, resyncing");
                self.note_failure(flight.base_seq);
                self.table.mark_stale();
                return Ok(None);
            }
        };
        if flight.applied_in(&snapshot, &me) {
            info!(
                command = %flight.command,
                seq = snapshot.turn_sequence,
                "action already applied, not resubmitting"
            );
            let seq = snapshot.turn_sequence;
            if let Some(outcome) = self.rebuild(snapshot) {
                return Ok(Some(outcome));
            }
            self.settle(flight, Some(seq));
            return Ok(None);
        }

        info!(command = %flight.command, "action not applied, resubmitting");
        flight.handle = self.spawn_request(flight.command.clone());
        flight.watchdog = Instant::now() + self.config.ack_watchdog;
        flight.resubmitted = true;
        self.in_flight = Some(flight);
        Ok(None)
    }

    /// Replace the table with the server's view.
    fn rebuild(&mut self, snapshot: RoomSnapshot) -> Option<SessionOutcome> {
        if snapshot.status == RoomStatus::Ended {
            info!(room = %self.room, "room has ended");
            self.archive_pointer();
            return Some(SessionOutcome::RoomEnded);
        }
        self.table = TableState::from_snapshot(self.table.me().clone(), &snapshot);
        None
    }

    async fn cancel_pending(&mut self) {
        let mut dropped = self.decision.take().is_some();
        if let Some(mut flight) = self.in_flight.take() {
            flight.cancel().await;
            dropped = true;
        }
        if dropped {
            // A turn still open after the rebuild is decided again.
            self.decided_at = None;
        }
        self.set_phase(Phase::Idle);
    }

    async fn resync<S>(&mut self, feed: &mut S) -> Result<Option<SessionOutcome>, SessionError>
    where
        S: Stream<Item = FeedEvent> + Unpin,
    {
        self.cancel_pending().await;
        while !self.connected {
            debug!("waiting for the event feed before resyncing");
            let Some(event) = feed.next().await else {
                return Err(SessionError::TransportExhausted(
                    "event feed closed".to_string(),
                ));
            };
            let signal = self.reconciler.on_feed(&mut self.table, event);
            if let Some(outcome) = self.on_signal(signal).await? {
                return Ok(Some(outcome));
            }
            if !self.table.is_stale() {
                return Ok(None);
            }
        }

        let me = self.table.me().clone();
        let mut attempt = 0;
        loop {
            attempt += 1;
            match self.gateway.room_state(&self.room, &me).await {
                Ok(snapshot) => {
                    info!(seq = snapshot.turn_sequence, attempt, "resynced from room state");
                    return Ok(self.rebuild(snapshot));
                }
                Err(err) if err.is_fatal() => return Err(SessionError::from_client(err)),
                Err(err) if attempt >= self.config.max_resync_attempts => {
                    return Err(SessionError::TransportExhausted(format!(
                        "resync failed after {attempt} attempts: {err}"
                    )));
                }
                Err(err) => {
                    let backoff = self.config.resync_backoff.saturating_mul(attempt);
                    warn!(%err, attempt, backoff_ms = backoff.as_millis() as u64, "resync failed");
                    sleep(backoff).await;
                }
            }
        }
    }

    async fn on_signal(&mut self, signal: Signal) -> Result<Option<SessionOutcome>, SessionError> {
        match signal {
            Signal::Quiet | Signal::Stale | Signal::Applied(None) => {}
            Signal::Applied(Some(notice)) => {
                self.tally.record(&notice);
                self.confirm_from_feed(&notice).await;
            }
            Signal::GameStarted { fresh: true } => {
                info!(room = %self.room, "game started");
                self.tally.reset();
                self.strategy.on_game_start();
                self.decided_at = None;
                self.failures = None;
                self.catchout_sent = None;
            }
            Signal::GameStarted { fresh: false } => {
                debug!("game start replayed, keeping the table");
            }
            Signal::GameEnded(end) => return Ok(Some(self.finish_game(end).await)),
            Signal::Connected { reconnect } => {
                self.connected = true;
                info!(reconnect, "event feed connected");
            }
            Signal::Disconnected => {
                self.connected = false;
            }
            Signal::Exhausted { attempts } => {
                return Err(SessionError::TransportExhausted(format!(
                    "event feed gave up after {attempts} reconnect attempts"
                )));
            }
        }
        self.check_decision();
        Ok(None)
    }

    /// Treat our own action on the feed as the acknowledgment of the request
    /// still waiting for one.
    async fn confirm_from_feed(&mut self, notice: &ActionNotice) {
        if &notice.player_id != self.table.me() {
            return;
        }
        let confirms = self.in_flight.as_ref().is_some_and(|flight| {
            flight.command.kind() == notice.kind && notice.turn_sequence > flight.base_seq
        });
        if !confirms {
            return;
        }
        let Some(mut flight) = self.in_flight.take() else {
            return;
        };
        flight.cancel().await;
        debug!(command = %flight.command, seq = notice.turn_sequence, "confirmed by the feed");
        self.settle(flight, Some(notice.turn_sequence));
    }

    async fn finish_game(&mut self, end: GameEnd) -> SessionOutcome {
        self.cancel_pending().await;
        let summary = self.tally.finish(&end);
        info!(
            room = %self.room,
            winner = %end.winner.id(),
            result = ?summary.result,
            placement = summary.placement,
            "game over"
        );
        self.sink.emit(&summary);
        self.strategy.on_game_end(&summary);
        self.archive_pointer();
        SessionOutcome::GameOver(summary)
    }

    fn pointer(&self, seq: TurnSequence) -> SessionPointer {
        SessionPointer {
            room_id: self.room.clone(),
            player_id: self.table.me().clone(),
            last_ack_seq: seq,
        }
    }

    fn save_pointer(&self, seq: Option<TurnSequence>) {
        let (Some(store), Some(seq)) = (&self.store, seq.or(self.table.last_applied())) else {
            return;
        };
        if let Err(err) = store.save(&self.pointer(seq)) {
            warn!(%err, path = %store.path().display(), "failed to persist session pointer");
        }
    }

    fn archive_pointer(&self) {
        let Some(store) = &self.store else {
            return;
        };
        let pointer = self.pointer(self.table.last_applied().unwrap_or_default());
        if let Err(err) = store.archive(&pointer) {
            warn!(%err, path = %store.path().display(), "failed to archive session pointer");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        strategy::BaseStrategy,
        table::tests::{action, num, play, turn},
    };
    use futures::channel::mpsc as feed_channel;
    use rand::{rngs::StdRng, Rng, SeedableRng};
    use std::{
        collections::VecDeque,
        sync::{
            atomic::{AtomicU64, AtomicUsize, Ordering},
            Mutex,
        },
    };
    use tokio::sync::mpsc;
    use unobot_types::{
        ActionKind, ActionResult, CardKind, Color, GameResult, Notification, Winner,
    };

    #[derive(Clone, Debug, PartialEq)]
    enum Call {
        Submit(Command),
        RoomState,
    }

    type Respond = Box<dyn Fn(&Command) -> Result<ActionAck, ClientError> + Send + Sync>;
    type Snapshot = Box<dyn Fn() -> Result<RoomSnapshot, ClientError> + Send + Sync>;

    struct Mock {
        respond: Respond,
        snapshot: Snapshot,
        delays: Mutex<VecDeque<Duration>>,
        calls: Mutex<Vec<Call>>,
        notify: mpsc::UnboundedSender<Call>,
        in_flight: AtomicUsize,
        max_in_flight: AtomicUsize,
    }

    impl Mock {
        fn record(&self, call: Call) {
            self.calls.lock().unwrap().push(call.clone());
            let _ = self.notify.send(call);
        }
    }

    #[derive(Clone)]
    struct MockGateway(Arc<Mock>);

    impl MockGateway {
        fn calls(&self) -> Vec<Call> {
            self.0.calls.lock().unwrap().clone()
        }

        fn delay_next(&self, delays: impl IntoIterator<Item = Duration>) {
            self.0.delays.lock().unwrap().extend(delays);
        }
    }

    struct Counted<'a>(&'a AtomicUsize);

    impl Drop for Counted<'_> {
        fn drop(&mut self) {
            self.0.fetch_sub(1, Ordering::SeqCst);
        }
    }

    impl Gateway for MockGateway {
        async fn submit(
            &self,
            _room: &RoomId,
            _player: &PlayerId,
            command: &Command,
        ) -> Result<ActionAck, ClientError> {
            let now = self.0.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            let _counted = Counted(&self.0.in_flight);
            self.0.max_in_flight.fetch_max(now, Ordering::SeqCst);
            self.0.record(Call::Submit(command.clone()));
            let delay = self.0.delays.lock().unwrap().pop_front().unwrap_or_default();
            sleep(delay).await;
            (self.0.respond)(command)
        }

        async fn room_state(
            &self,
            _room: &RoomId,
            _player: &PlayerId,
        ) -> Result<RoomSnapshot, ClientError> {
            self.0.record(Call::RoomState);
            (self.0.snapshot)()
        }
    }

    fn mock(
        respond: impl Fn(&Command) -> Result<ActionAck, ClientError> + Send + Sync + 'static,
        snapshot: impl Fn() -> Result<RoomSnapshot, ClientError> + Send + Sync + 'static,
    ) -> (MockGateway, mpsc::UnboundedReceiver<Call>) {
        let (notify, calls) = mpsc::unbounded_channel();
        let gateway = MockGateway(Arc::new(Mock {
            respond: Box::new(respond),
            snapshot: Box::new(snapshot),
            delays: Mutex::new(VecDeque::new()),
            calls: Mutex::new(Vec::new()),
            notify,
            in_flight: AtomicUsize::new(0),
            max_in_flight: AtomicUsize::new(0),
        }));
        (gateway, calls)
    }

    fn no_room() -> Result<RoomSnapshot, ClientError> {
        Err(ClientError::ConnectionClosed)
    }

    /// Answers with a fixed action after `delay`, or fails.
    struct Fixed {
        delay: Duration,
        answer: Result<Action, StrategyError>,
    }

    impl Strategy for Fixed {
        fn name(&self) -> &'static str {
            "fixed"
        }

        fn decide(&self, _view: &TableView, _deadline: Deadline) -> Result<Action, StrategyError> {
            std::thread::sleep(self.delay);
            self.answer.clone()
        }
    }

    fn practice() -> CoordinatorConfig {
        CoordinatorConfig {
            turn_timeout: None,
            ..Default::default()
        }
    }

    struct Session {
        feed: feed_channel::UnboundedSender<FeedEvent>,
        summaries: mpsc::UnboundedReceiver<GameSummary>,
        handle: JoinHandle<Result<SessionOutcome, SessionError>>,
    }

    impl Session {
        fn send(&self, notification: Notification) {
            self.event(FeedEvent::Notification(notification));
        }

        fn event(&self, event: FeedEvent) {
            self.feed.unbounded_send(event).unwrap();
        }

        fn reconnect(&self) {
            self.event(FeedEvent::Disconnected {
                reason: "reset by peer".to_string(),
            });
            self.event(FeedEvent::Connected { reconnect: true });
        }

        async fn outcome(self) -> SessionOutcome {
            tokio::time::timeout(Duration::from_secs(5), self.handle)
                .await
                .expect("session did not finish")
                .unwrap()
                .unwrap()
        }
    }

    fn start(
        gateway: MockGateway,
        strategy: Arc<dyn Strategy>,
        config: CoordinatorConfig,
        store: Option<PointerStore>,
    ) -> Session {
        let (feed, events) = feed_channel::unbounded();
        let (sink, summaries) = mpsc::unbounded_channel();
        let mut coordinator = Coordinator::new(
            gateway,
            "room-1".into(),
            TableState::new("me".into()),
            strategy,
            config,
        )
        .with_sink(sink);
        if let Some(store) = store {
            coordinator = coordinator.with_store(store);
        }
        feed.unbounded_send(FeedEvent::Connected { reconnect: false })
            .unwrap();
        Session {
            feed,
            summaries,
            handle: tokio::spawn(coordinator.run(events)),
        }
    }

    async fn next_call(calls: &mut mpsc::UnboundedReceiver<Call>) -> Call {
        tokio::time::timeout(Duration::from_secs(5), calls.recv())
            .await
            .expect("no gateway call")
            .unwrap()
    }

    fn game_end(seq: Option<u64>, winner: &str) -> Notification {
        Notification::GameEnd(GameEnd {
            turn_sequence: seq,
            winner: Winner::Id(winner.into()),
            score: 20,
            reason: None,
            players: Vec::new(),
        })
    }

    fn acks_from(start: u64) -> impl Fn(&Command) -> Result<ActionAck, ClientError> {
        let seq = AtomicU64::new(start);
        move |command| {
            Ok(ActionAck {
                success: Some(true),
                turn_sequence: Some(seq.fetch_add(1, Ordering::SeqCst) + 1),
                hand_size: None,
                result: ActionResult {
                    uno: *command == Command::CallUno,
                    ..Default::default()
                },
            })
        }
    }

    fn submitted(gateway: &MockGateway) -> Vec<Command> {
        gateway
            .calls()
            .into_iter()
            .filter_map(|call| match call {
                Call::Submit(command) => Some(command),
                Call::RoomState => None,
            })
            .collect()
    }

    #[tokio::test]
    async fn uno_is_called_before_the_second_to_last_card() {
        let (gateway, mut calls) = mock(acks_from(10), no_room);
        let session = start(gateway.clone(), Arc::new(BaseStrategy), practice(), None);
        session.send(turn(
            10,
            "me",
            Some(vec![num(Color::Red, 5), num(Color::Blue, 7)]),
        ));

        assert_eq!(next_call(&mut calls).await, Call::Submit(Command::CallUno));
        session.send(Notification::Action(action(11, ActionKind::Uno, "me")));
        assert_eq!(
            next_call(&mut calls).await,
            Call::Submit(Command::Play {
                index: 0,
                color: None
            })
        );
        session.send(play(12, "me", num(Color::Red, 5), 1));
        session.send(turn(13, "p2", None));
        session.send(game_end(Some(14), "p2"));

        let SessionOutcome::GameOver(summary) = session.outcome().await else {
            panic!("expected game over");
        };
        assert_eq!(summary.actions.cards_played, 1);
        assert_eq!(summary.actions.uno_calls, 1);
        assert_eq!(
            submitted(&gateway),
            vec![
                Command::CallUno,
                Command::Play {
                    index: 0,
                    color: None
                }
            ]
        );
    }

    #[tokio::test]
    async fn gap_resyncs_before_anything_is_submitted() {
        let (gateway, mut calls) = mock(acks_from(13), || {
            Ok(RoomSnapshot {
                turn_sequence: 13,
                status: RoomStatus::Playing,
                current_player_id: Some("me".into()),
                top_card: Some(num(Color::Red, 5)),
                current_color: Some(Color::Red),
                players: Vec::new(),
                hand: vec![num(Color::Red, 1), num(Color::Blue, 2), num(Color::Green, 3)],
            })
        });
        let session = start(gateway.clone(), Arc::new(BaseStrategy), practice(), None);
        session.send(turn(10, "p2", None));
        session.send(turn(
            13,
            "me",
            Some(vec![num(Color::Red, 1), num(Color::Blue, 2), num(Color::Green, 3)]),
        ));

        assert_eq!(next_call(&mut calls).await, Call::RoomState);
        assert_eq!(
            next_call(&mut calls).await,
            Call::Submit(Command::Play {
                index: 0,
                color: None
            })
        );
        session.send(game_end(None, "p2"));
        session.outcome().await;
        assert_eq!(gateway.calls()[0], Call::RoomState);
    }

    fn my_turn_snapshot(seq: u64, hand: Vec<Card>) -> RoomSnapshot {
        RoomSnapshot {
            turn_sequence: seq,
            status: RoomStatus::Playing,
            current_player_id: Some("me".into()),
            top_card: Some(num(Color::Red, 5)),
            current_color: Some(Color::Red),
            players: Vec::new(),
            hand,
        }
    }

    #[tokio::test]
    async fn turn_is_decided_again_after_a_reconnect_mid_decision() {
        let (gateway, mut calls) = mock(
            |_| Ok(ActionAck::default()),
            || Ok(my_turn_snapshot(10, vec![num(Color::Blue, 2)])),
        );
        let strategy = Arc::new(Fixed {
            delay: Duration::from_millis(200),
            answer: Ok(Action::Draw),
        });
        let session = start(gateway.clone(), strategy, practice(), None);
        session.send(turn(10, "me", Some(vec![num(Color::Blue, 2)])));
        session.reconnect();

        assert_eq!(next_call(&mut calls).await, Call::RoomState);
        assert_eq!(next_call(&mut calls).await, Call::Submit(Command::Draw));
        session.send(game_end(None, "p2"));
        session.outcome().await;
        assert_eq!(
            gateway.calls(),
            vec![Call::RoomState, Call::Submit(Command::Draw)]
        );
    }

    #[tokio::test]
    async fn unanswered_request_is_sent_once_more_after_a_reconnect() {
        let (gateway, mut calls) = mock(
            |_| Ok(ActionAck::default()),
            || Ok(my_turn_snapshot(10, vec![num(Color::Blue, 2)])),
        );
        gateway.delay_next([Duration::from_secs(30)]);
        let session = start(gateway.clone(), Arc::new(BaseStrategy), practice(), None);
        session.send(turn(10, "me", Some(vec![num(Color::Blue, 2)])));
        assert_eq!(next_call(&mut calls).await, Call::Submit(Command::Draw));

        session.reconnect();
        assert_eq!(next_call(&mut calls).await, Call::RoomState);
        assert_eq!(next_call(&mut calls).await, Call::Submit(Command::Draw));
        session.send(game_end(None, "p2"));
        session.outcome().await;
        assert_eq!(
            gateway.calls(),
            vec![
                Call::Submit(Command::Draw),
                Call::RoomState,
                Call::Submit(Command::Draw)
            ]
        );
        assert_eq!(gateway.0.max_in_flight.load(Ordering::SeqCst), 1);
        assert_eq!(gateway.0.in_flight.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn gap_while_awaiting_ack_idles_until_the_rebuild() {
        let (gateway, mut calls) = mock(
            |_| Ok(ActionAck::default()),
            || {
                Ok(RoomSnapshot {
                    current_player_id: Some("p2".into()),
                    ..my_turn_snapshot(13, vec![num(Color::Blue, 2)])
                })
            },
        );
        gateway.delay_next([Duration::from_secs(30)]);
        let mut table = TableState::new("me".into());
        table.apply(&turn(10, "me", Some(vec![num(Color::Blue, 2)])));
        let mut coordinator = Coordinator::new(
            gateway.clone(),
            "room-1".into(),
            table,
            Arc::new(BaseStrategy),
            practice(),
        );
        coordinator.connected = true;
        coordinator.send(Command::Draw, None, None);
        assert_eq!(coordinator.phase(), Phase::AwaitingAck);
        assert_eq!(next_call(&mut calls).await, Call::Submit(Command::Draw));

        let signal = coordinator
            .reconciler
            .on_feed(&mut coordinator.table, FeedEvent::Notification(turn(13, "p2", None)));
        assert_eq!(signal, Signal::Stale);
        assert_eq!(coordinator.on_signal(signal).await.unwrap(), None);
        assert!(coordinator.table().is_stale());
        assert_eq!(submitted(&gateway), vec![Command::Draw]);

        let mut feed = futures::stream::empty::<FeedEvent>();
        assert_eq!(coordinator.resync(&mut feed).await.unwrap(), None);
        assert_eq!(coordinator.phase(), Phase::Idle);
        assert!(coordinator.in_flight.is_none());
        assert_eq!(coordinator.table().last_applied(), Some(13));
        assert_eq!(gateway.0.in_flight.load(Ordering::SeqCst), 0);

        coordinator.advance();
        assert_eq!(coordinator.phase(), Phase::Idle);
        assert_eq!(
            gateway.calls(),
            vec![Call::Submit(Command::Draw), Call::RoomState]
        );
    }

    #[tokio::test]
    async fn watchdog_does_not_resubmit_an_applied_action() {
        let (gateway, mut calls) = mock(
            |_| Ok(ActionAck::default()),
            || {
                Ok(RoomSnapshot {
                    turn_sequence: 11,
                    status: RoomStatus::Playing,
                    current_player_id: Some("p2".into()),
                    top_card: Some(num(Color::Red, 5)),
                    current_color: Some(Color::Red),
                    players: Vec::new(),
                    hand: vec![num(Color::Blue, 2), num(Color::Green, 3)],
                })
            },
        );
        gateway.delay_next([Duration::from_secs(30)]);
        let config = CoordinatorConfig {
            ack_watchdog: Duration::from_millis(50),
            ..practice()
        };
        let session = start(gateway.clone(), Arc::new(BaseStrategy), config, None);
        session.send(turn(10, "me", Some(vec![num(Color::Blue, 2)])));

        assert_eq!(next_call(&mut calls).await, Call::Submit(Command::Draw));
        assert_eq!(next_call(&mut calls).await, Call::RoomState);
        session.send(game_end(Some(12), "p2"));
        session.outcome().await;
        assert_eq!(
            gateway.calls(),
            vec![Call::Submit(Command::Draw), Call::RoomState]
        );
        assert_eq!(gateway.0.in_flight.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn watchdog_resubmits_the_identical_action_once() {
        let (gateway, mut calls) = mock(
            |_| Ok(ActionAck::default()),
            || {
                Ok(RoomSnapshot {
                    turn_sequence: 10,
                    status: RoomStatus::Playing,
                    current_player_id: Some("me".into()),
                    top_card: Some(num(Color::Red, 5)),
                    current_color: Some(Color::Red),
                    players: Vec::new(),
                    hand: vec![num(Color::Blue, 2)],
                })
            },
        );
        gateway.delay_next([Duration::from_secs(30)]);
        let config = CoordinatorConfig {
            ack_watchdog: Duration::from_millis(50),
            ..practice()
        };
        let session = start(gateway.clone(), Arc::new(BaseStrategy), config, None);
        session.send(turn(10, "me", Some(vec![num(Color::Blue, 2)])));

        assert_eq!(next_call(&mut calls).await, Call::Submit(Command::Draw));
        assert_eq!(next_call(&mut calls).await, Call::RoomState);
        assert_eq!(next_call(&mut calls).await, Call::Submit(Command::Draw));
        session.send(game_end(None, "p2"));
        session.outcome().await;
        assert_eq!(
            gateway.calls(),
            vec![
                Call::Submit(Command::Draw),
                Call::RoomState,
                Call::Submit(Command::Draw)
            ]
        );
    }

    #[tokio::test]
    async fn decision_is_discarded_when_the_turn_moves_on() {
        let (gateway, _calls) = mock(acks_from(1), no_room);
        let strategy = Arc::new(Fixed {
            delay: Duration::from_millis(300),
            answer: Ok(Action::Draw),
        });
        let session = start(gateway.clone(), strategy, practice(), None);
        session.send(turn(1, "me", Some(vec![num(Color::Blue, 2)])));
        // The server timed us out and drew on our behalf.
        session.send(Notification::Action(ActionNotice {
            hand_size: Some(2),
            result: ActionResult {
                card: Some(num(Color::Green, 3)),
                ..Default::default()
            },
            ..action(2, ActionKind::Draw, "me")
        }));
        session.send(turn(3, "p2", None));
        session.send(game_end(Some(4), "p2"));

        let SessionOutcome::GameOver(summary) = session.outcome().await else {
            panic!("expected game over");
        };
        assert_eq!(summary.actions.cards_drawn, 1);
        assert!(submitted(&gateway).is_empty());
    }

    #[tokio::test]
    async fn slow_or_failing_strategies_fall_back_to_draw() {
        let cases: [(Arc<dyn Strategy>, CoordinatorConfig); 2] = [
            (
                Arc::new(Fixed {
                    delay: Duration::from_millis(500),
                    answer: Ok(Action::Play {
                        index: 0,
                        color: None,
                    }),
                }),
                CoordinatorConfig {
                    turn_timeout: Some(Duration::from_millis(100)),
                    decision_margin: Duration::ZERO,
                    ..Default::default()
                },
            ),
            (
                Arc::new(Fixed {
                    delay: Duration::ZERO,
                    answer: Err(StrategyError::Internal("boom".to_string())),
                }),
                practice(),
            ),
        ];
        for (strategy, config) in cases {
            let (gateway, mut calls) = mock(|_| Ok(ActionAck::default()), no_room);
            let session = start(gateway, strategy, config, None);
            session.send(turn(
                1,
                "me",
                Some(vec![num(Color::Red, 1), num(Color::Blue, 2), num(Color::Blue, 3)]),
            ));
            assert_eq!(next_call(&mut calls).await, Call::Submit(Command::Draw));
            session.send(game_end(None, "p2"));
            session.outcome().await;
        }
    }

    #[tokio::test]
    async fn illegal_wild_draw_four_is_replaced_by_draw() {
        let (gateway, mut calls) = mock(|_| Ok(ActionAck::default()), no_room);
        let strategy = Arc::new(Fixed {
            delay: Duration::ZERO,
            answer: Ok(Action::Play {
                index: 2,
                color: Some(Color::Blue),
            }),
        });
        let session = start(gateway.clone(), strategy, practice(), None);
        session.send(turn(
            1,
            "me",
            Some(vec![
                num(Color::Red, 5),
                num(Color::Blue, 7),
                Card::wild(CardKind::WildDrawFour),
            ]),
        ));
        assert_eq!(next_call(&mut calls).await, Call::Submit(Command::Draw));
        session.send(game_end(None, "p2"));
        session.outcome().await;
        assert_eq!(submitted(&gateway), vec![Command::Draw]);
    }

    #[tokio::test]
    async fn missed_uno_is_caught_out_once() {
        let (gateway, mut calls) = mock(|_| Ok(ActionAck::default()), no_room);
        let session = start(gateway.clone(), Arc::new(BaseStrategy), practice(), None);
        session.send(turn(1, "p2", None));
        session.send(play(2, "p2", num(Color::Red, 9), 1));

        assert_eq!(
            next_call(&mut calls).await,
            Call::Submit(Command::Catchout {
                target: "p2".into()
            })
        );
        session.send(turn(3, "p3", None));
        session.send(game_end(None, "p3"));
        session.outcome().await;
        assert_eq!(
            submitted(&gateway),
            vec![Command::Catchout {
                target: "p2".into()
            }]
        );
    }

    #[tokio::test]
    async fn pointer_is_first_written_by_an_acknowledged_draw() {
        let dir = tempfile::tempdir().unwrap();
        let store = PointerStore::new(dir.path().join("session.json"));
        let (gateway, mut calls) = mock(
            |command| {
                Ok(match command {
                    Command::Draw => ActionAck {
                        success: Some(true),
                        turn_sequence: Some(11),
                        hand_size: Some(2),
                        result: ActionResult {
                            card: Some(num(Color::Green, 3)),
                            ..Default::default()
                        },
                    },
                    _ => ActionAck::default(),
                })
            },
            no_room,
        );
        let strategy = Arc::new(Fixed {
            delay: Duration::from_millis(100),
            answer: Ok(Action::Draw),
        });
        let session = start(gateway, strategy, practice(), Some(store.clone()));
        session.send(turn(10, "me", Some(vec![num(Color::Blue, 2)])));
        assert!(store.load().unwrap().is_none());

        assert_eq!(next_call(&mut calls).await, Call::Submit(Command::Draw));
        let saved = tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                if let Some(pointer) = store.load().unwrap() {
                    break pointer;
                }
                sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("pointer was never written");
        assert_eq!(saved.last_ack_seq, 11);
        assert_eq!(saved.player_id.as_str(), "me");

        session.send(game_end(None, "p2"));
        session.outcome().await;
    }

    #[tokio::test]
    async fn game_end_emits_summary_and_archives_pointer() {
        let dir = tempfile::tempdir().unwrap();
        let store = PointerStore::new(dir.path().join("session.json"));
        let (gateway, mut calls) = mock(
            |_| {
                Ok(ActionAck {
                    success: Some(true),
                    turn_sequence: Some(2),
                    hand_size: Some(2),
                    result: ActionResult::default(),
                })
            },
            no_room,
        );
        let mut session = start(
            gateway,
            Arc::new(BaseStrategy),
            practice(),
            Some(store.clone()),
        );
        session.send(turn(
            1,
            "me",
            Some(vec![num(Color::Red, 1), num(Color::Blue, 2), num(Color::Green, 3)]),
        ));
        assert_eq!(
            next_call(&mut calls).await,
            Call::Submit(Command::Play {
                index: 0,
                color: None
            })
        );
        session.send(play(2, "me", num(Color::Red, 1), 2));
        session.send(turn(3, "p2", None));
        session.send(game_end(Some(4), "p2"));

        let emitted = tokio::time::timeout(Duration::from_secs(5), session.summaries.recv())
            .await
            .unwrap()
            .unwrap();
        let SessionOutcome::GameOver(summary) = session.outcome().await else {
            panic!("expected game over");
        };
        assert_eq!(emitted, summary);
        assert_eq!(summary.result, GameResult::Lost);
        assert_eq!(summary.placement, 2);
        assert_eq!(summary.points, 0);
        assert_eq!(summary.actions.cards_played, 1);
        assert_eq!(summary.card_kinds.get(&CardKind::Number), Some(&1));

        assert!(store.load().unwrap().is_none());
        let archived: SessionPointer =
            serde_json::from_str(&std::fs::read_to_string(store.archive_path()).unwrap())
                .unwrap();
        assert_eq!(archived.room_id.as_str(), "room-1");
        assert_eq!(archived.player_id.as_str(), "me");
        assert_eq!(archived.last_ack_seq, 4);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn at_most_one_action_in_flight_under_feed_bursts() {
        let (gateway, _calls) = mock(|_| Ok(ActionAck::default()), no_room);
        gateway.delay_next((0..2_000).map(|i| Duration::from_millis(i % 7)));
        let session = start(gateway.clone(), Arc::new(BaseStrategy), practice(), None);

        let hand = vec![
            num(Color::Red, 1),
            num(Color::Blue, 2),
            num(Color::Green, 3),
            num(Color::Yellow, 4),
        ];
        let mut rng = StdRng::seed_from_u64(7);
        let mut history: Vec<Notification> = Vec::new();
        for seq in 1..=400u64 {
            let notification = match rng.gen_range(0..4) {
                0 => turn(seq, "me", Some(hand.clone())),
                1 => turn(seq, "p2", None),
                2 => play(
                    seq,
                    "p3",
                    num(Color::Red, rng.gen_range(0..10)),
                    rng.gen_range(1..4),
                ),
                _ => Notification::Action(action(seq, ActionKind::Draw, "p2")),
            };
            history.push(notification.clone());
            session.send(notification);
            if rng.gen_bool(0.2) {
                let replay = history[rng.gen_range(0..history.len())].clone();
                session.send(replay);
            }
            if rng.gen_bool(0.3) {
                sleep(Duration::from_millis(1)).await;
            }
        }
        session.send(game_end(None, "p2"));
        session.outcome().await;

        assert!(!submitted(&gateway).is_empty());
        assert_eq!(gateway.0.max_in_flight.load(Ordering::SeqCst), 1);
    }
}
