//! The long-running connection to the charge controller.
//!
//! A session discovers the controller, subscribes to its notifications and then polls it
//! forever. Any failure sends it back to discovery after a backoff. Failures are counted
//! by the [`RecoveryPolicy`], which resets the radio stack when they pile up.
//!
//! Notifications arrive on the transport's own task. They are folded into the session's
//! [`FrameBuffer`] right there, and only completed frames cross over to the polling side.

use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::PoisonError;
use std::time::Duration;

use anyhow::anyhow;
use chrono::DateTime;
use chrono::Utc;
use tokio::sync::mpsc;
use tokio::sync::watch;
use tokio::time::sleep;
use tokio::time::timeout;
use tracing::debug;
use tracing::info;
use tracing::warn;

use crate::config::Config;
use crate::config::DeviceConfig;
use crate::config::TimingConfig;
use crate::error::LinkError;
use crate::message::frame_buffer::FrameBuffer;
use crate::message::frame_decoder;
use crate::message::frame_decoder::DecodeError;
use crate::message::frame_decoder::Decoded;
use crate::message::POLL_COMMAND;
use crate::reading::Reading;
use crate::recovery::RadioReset;
use crate::recovery::RecoveryPolicy;
use crate::store::TelemetryStore;
use crate::transport::Chunk;
use crate::transport::ChunkCallback;
use crate::transport::Subscription;
use crate::transport::Transport;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Disconnected,
    Discovering,
    Connecting,
    Subscribing,
    Polling,
    Failed,
}

/// Extra time given to a transport's own scan/connect timeout before the session gives up on
/// the call, so the transport can clean up after itself first.
const TRANSPORT_GRACE: Duration = Duration::from_secs(5);

/// A frame as handed over by the notification callback.
struct CompletedFrame {
    bytes: Vec<u8>,
    completed_at: DateTime<Utc>,
}

pub struct LinkSession<T, R> {
    transport: T,
    device: DeviceConfig,
    timing: TimingConfig,
    store: TelemetryStore,
    recovery: RecoveryPolicy<R>,
    buffer: Arc<Mutex<FrameBuffer>>,
    /// Bumped on every subscribe. Callbacks from older subscriptions see a different value
    /// and drop their chunks.
    generation: Arc<AtomicU64>,
    state: watch::Sender<SessionState>,
}

impl<T: Transport, R: RadioReset> LinkSession<T, R> {
    pub fn new(transport: T, config: &Config, store: TelemetryStore, radio: R) -> Self {
        let (state, _) = watch::channel(SessionState::Disconnected);
        Self {
            transport,
            device: config.device.clone(),
            timing: config.timing.clone(),
            store,
            recovery: RecoveryPolicy::new(config.recovery.threshold, radio),
            buffer: Arc::new(Mutex::new(FrameBuffer::new())),
            generation: Arc::new(AtomicU64::new(0)),
            state,
        }
    }

    pub fn state(&self) -> SessionState {
        *self.state.borrow()
    }

    /// Follow the session's state transitions.
    pub fn watch_state(&self) -> watch::Receiver<SessionState> {
        self.state.subscribe()
    }

    pub fn recovery(&self) -> &RecoveryPolicy<R> {
        &self.recovery
    }

    /// Keep the link up for as long as the process lives. Never returns.
    pub async fn run(&mut self) {
        loop {
            if let Err(err) = self.attempt().await {
                self.recover(err).await;
            }
        }
    }

    /// Discover, connect, subscribe and poll until something fails.
    ///
    /// The connection is closed before returning.
    pub async fn attempt(&mut self) -> Result<(), LinkError> {
        self.transition(SessionState::Discovering);
        let device = self.discover().await?;

        self.transition(SessionState::Connecting);
        let connect_timeout = self.timing.connect_timeout();
        let connection = timeout(connect_timeout + TRANSPORT_GRACE, self.transport.connect(&device, connect_timeout))
            .await
            .map_err(|_| LinkError::ConnectFailure(anyhow!("Connect did not finish within {connect_timeout:?}")))?
            .map_err(LinkError::ConnectFailure)?;

        let result = self.serve(&connection).await;

        if let Err(err) = self.transport.disconnect(connection).await {
            warn!("Failed to disconnect: {err:#}");
        }
        result
    }

    /// Count the failure, possibly resetting the radio, then back off and go back to discovery.
    pub async fn recover(&mut self, err: LinkError) {
        self.transition(SessionState::Failed);
        let malformed = self.malformed_chunks();
        self.recovery.observe_malformed_chunks(malformed);
        self.recovery.record_failure(&err).await;
        sleep(self.timing.backoff()).await;
        self.transition(SessionState::Discovering);
    }

    async fn discover(&self) -> Result<T::Device, LinkError> {
        let name = &self.device.name_filter;
        let discovery_timeout = self.timing.discovery_timeout();
        let scanned = timeout(discovery_timeout + TRANSPORT_GRACE, self.transport.scan(name, discovery_timeout)).await;
        match scanned {
            Ok(Ok(Some(device))) => Ok(device),
            Ok(Ok(None)) | Err(_) => Err(LinkError::DiscoveryTimeout { name: name.clone(), timeout: discovery_timeout }),
            Ok(Err(err)) => Err(LinkError::DiscoveryFailure(err)),
        }
    }

    async fn serve(&mut self, connection: &T::Connection) -> Result<(), LinkError> {
        self.transition(SessionState::Subscribing);
        let mut frames = self.subscribe(connection).await?;

        self.transition(SessionState::Polling);
        loop {
            self.poll(connection, &mut frames).await?;
            sleep(self.timing.poll_interval()).await;
        }
    }

    async fn subscribe(
        &mut self,
        connection: &T::Connection,
    ) -> Result<mpsc::UnboundedReceiver<CompletedFrame>, LinkError> {
        let current = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        self.lock_buffer().reset();

        let (frames_tx, frames_rx) = mpsc::unbounded_channel();
        let buffer = self.buffer.clone();
        let generation = self.generation.clone();
        let callback: ChunkCallback = Arc::new(move |chunk: Chunk| {
            if generation.load(Ordering::SeqCst) != current {
                debug!(characteristic = %chunk.characteristic, "Dropping chunk from a previous subscription");
                return;
            }
            debug!(characteristic = %chunk.characteristic, data = %hex::encode(&chunk.data), "Chunk");
            let frame = buffer.lock().unwrap_or_else(PoisonError::into_inner).push(&chunk.data);
            if let Some(bytes) = frame {
                let _ = frames_tx.send(CompletedFrame { bytes, completed_at: Utc::now() });
            }
        });

        let subscribe_timeout = self.timing.subscribe_timeout();
        for characteristic in &self.device.notify_characteristics {
            match timeout(subscribe_timeout, self.transport.unsubscribe(connection, characteristic)).await {
                Ok(Ok(())) => {}
                Ok(Err(err)) => warn!(%characteristic, "Failed to clear stale subscription: {err:#}"),
                Err(_) => warn!(%characteristic, "Timed out clearing stale subscription"),
            }

            let subscribed = timeout(
                subscribe_timeout,
                self.transport.subscribe(connection, characteristic, callback.clone()),
            )
            .await
            .map_err(|_| LinkError::SubscribeFailure(anyhow!("Timed out subscribing to {characteristic}")))?
            .map_err(|err| LinkError::SubscribeFailure(err.context(format!("subscribe to {characteristic}"))))?;

            match subscribed {
                Subscription::Started => info!(%characteristic, "Subscribed"),
                Subscription::AlreadyActive => info!(%characteristic, "Already subscribed"),
            }
        }

        Ok(frames_rx)
    }

    /// Request one report and wait for it.
    ///
    /// Only a frame completed after the request is written can answer it.
    async fn poll(
        &mut self,
        connection: &T::Connection,
        frames: &mut mpsc::UnboundedReceiver<CompletedFrame>,
    ) -> Result<(), LinkError> {
        let response_timeout = self.timing.response_timeout();

        let mut stale = 0;
        while frames.try_recv().is_ok() {
            stale += 1;
        }
        if stale > 0 {
            debug!(stale, "Discarding frames completed before the poll");
        }

        timeout(
            response_timeout,
            self.transport.write(
                connection,
                &self.device.write_characteristic,
                &POLL_COMMAND,
                self.device.write_with_response,
            ),
        )
        .await
        .map_err(|_| LinkError::WriteFailure(anyhow!("Timed out after {response_timeout:?}")))?
        .map_err(LinkError::WriteFailure)?;

        let reading = timeout(response_timeout, self.next_reading(frames))
            .await
            .map_err(|_| LinkError::ResponseTimeout(response_timeout))??;

        info!(
            current_a = reading.charging_current_a,
            battery_v = reading.battery_voltage_v,
            panel_v = reading.panel_voltage_v,
            power_w = reading.charging_power_w,
            capacity_ah = reading.charging_capacity_ah,
            energy_wh = reading.energy_daily_wh,
            "Reading"
        );
        self.store.publish(reading);
        let malformed = self.malformed_chunks();
        self.recovery.observe_malformed_chunks(malformed);
        self.recovery.record_success();
        Ok(())
    }

    /// Decode completed frames until one holds a full reading.
    async fn next_reading(&self, frames: &mut mpsc::UnboundedReceiver<CompletedFrame>) -> Result<Reading, LinkError> {
        loop {
            let Some(frame) = frames.recv().await else {
                return Err(LinkError::SubscribeFailure(anyhow!("All notification streams ended")));
            };
            match frame_decoder::decode(&frame.bytes, frame.completed_at) {
                Ok(Decoded::Reading(reading)) => return Ok(reading),
                Ok(Decoded::VoltageSample(sample)) => {
                    info!(voltage_v = sample.voltage_v, "Voltage sample");
                    self.store.publish_voltage_sample(sample);
                }
                Err(DecodeError::Truncated { len }) => {
                    debug!(len, frame = %String::from_utf8_lossy(&frame.bytes), "Dropping short frame");
                }
                Err(err) => return Err(err.into()),
            }
        }
    }

    fn transition(&self, next: SessionState) {
        let previous = self.state.send_replace(next);
        if previous != next {
            info!(from = ?previous, to = ?next, "Session state");
        }
    }

    fn lock_buffer(&self) -> std::sync::MutexGuard<'_, FrameBuffer> {
        self.buffer.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn malformed_chunks(&self) -> u64 {
        self.lock_buffer().malformed_chunks()
    }
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;
    use std::sync::atomic::AtomicUsize;
    use std::sync::atomic::Ordering;
    use std::time::Duration;

    use async_trait::async_trait;
    use tokio::time::Instant;

    use super::*;
    use crate::transport::CharacteristicId;

    const FRAME_A: [&[u8]; 3] = [b"00128000050128\r", b"001128050", b"\n"];
    const FRAME_B: [&[u8]; 3] = [b"00076500089183\r", b"\x02045132123", b"\n"];

    /// Scripted outcomes for each transport call. Unscripted calls succeed.
    #[derive(Default)]
    struct Script {
        scans: VecDeque<anyhow::Result<bool>>,
        connect_error: bool,
        connect_hangs: bool,
        subscribe_error: bool,
        subscribe_hangs: bool,
        unsubscribe_error: bool,
        already_subscribed: bool,
        /// Chunks delivered after each poll write. Once exhausted, writes fail.
        replies: VecDeque<Vec<Vec<u8>>>,
        writes: usize,
        callbacks: Vec<ChunkCallback>,
        disconnects: usize,
    }

    #[derive(Clone, Default)]
    struct FakeTransport {
        script: Arc<Mutex<Script>>,
    }

    impl FakeTransport {
        fn with(build: impl FnOnce(&mut Script)) -> Self {
            let fake = Self::default();
            build(&mut fake.script());
            fake
        }

        fn script(&self) -> std::sync::MutexGuard<'_, Script> {
            self.script.lock().unwrap()
        }
    }

    fn reply(chunks: &[&[u8]]) -> Vec<Vec<u8>> {
        chunks.iter().map(|c| c.to_vec()).collect()
    }

    #[async_trait]
    impl Transport for FakeTransport {
        type Device = ();
        type Connection = ();

        async fn scan(&self, _name_filter: &str, _timeout: Duration) -> anyhow::Result<Option<()>> {
            match self.script().scans.pop_front() {
                Some(Ok(found)) => Ok(found.then_some(())),
                Some(Err(err)) => Err(err),
                None => Ok(Some(())),
            }
        }

        async fn connect(&self, _device: &(), _timeout: Duration) -> anyhow::Result<()> {
            let hangs = self.script().connect_hangs;
            if hangs {
                std::future::pending::<()>().await;
            }
            if self.script().connect_error {
                anyhow::bail!("le-connection-abort-by-local");
            }
            Ok(())
        }

        async fn subscribe(
            &self,
            _connection: &(),
            _characteristic: &CharacteristicId,
            callback: ChunkCallback,
        ) -> anyhow::Result<Subscription> {
            let hangs = self.script().subscribe_hangs;
            if hangs {
                std::future::pending::<()>().await;
            }
            let mut script = self.script();
            if script.subscribe_error {
                anyhow::bail!("Notify acquired");
            }
            script.callbacks.push(callback);
            Ok(if script.already_subscribed { Subscription::AlreadyActive } else { Subscription::Started })
        }

        async fn unsubscribe(&self, _connection: &(), _characteristic: &CharacteristicId) -> anyhow::Result<()> {
            if self.script().unsubscribe_error {
                anyhow::bail!("Not subscribed");
            }
            Ok(())
        }

        async fn write(
            &self,
            _connection: &(),
            _characteristic: &CharacteristicId,
            data: &[u8],
            _with_response: bool,
        ) -> anyhow::Result<()> {
            assert_eq!(data, &POLL_COMMAND);
            let (chunks, callback) = {
                let mut script = self.script();
                script.writes += 1;
                let Some(chunks) = script.replies.pop_front() else {
                    anyhow::bail!("Write failed");
                };
                (chunks, script.callbacks.last().cloned())
            };
            // Deliver from another task, like a real notification stream.
            if let Some(callback) = callback {
                tokio::spawn(async move {
                    for data in chunks {
                        tokio::task::yield_now().await;
                        callback(Chunk { characteristic: CharacteristicId::Handle(0x29), data });
                    }
                });
            }
            Ok(())
        }

        async fn disconnect(&self, _connection: ()) -> anyhow::Result<()> {
            self.script().disconnects += 1;
            Ok(())
        }
    }

    #[derive(Clone, Default)]
    struct CountingReset {
        calls: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl RadioReset for CountingReset {
        async fn reset_adapter(&self) -> bool {
            self.calls.fetch_add(1, Ordering::SeqCst);
            false
        }
    }

    fn new_session(fake: &FakeTransport) -> (LinkSession<FakeTransport, CountingReset>, TelemetryStore, CountingReset) {
        let store = TelemetryStore::new();
        let reset = CountingReset::default();
        let session = LinkSession::new(fake.clone(), &Config::default(), store.clone(), reset.clone());
        (session, store, reset)
    }

    #[tokio::test(start_paused = true)]
    async fn test_poll_publishes_reading() {
        let fake = FakeTransport::with(|s| s.replies.push_back(reply(&FRAME_A)));
        let (mut session, store, _) = new_session(&fake);

        let err = session.attempt().await.unwrap_err();
        assert!(matches!(err, LinkError::WriteFailure(_)), "{err}");

        let reading = store.get_last_reading().unwrap();
        assert_eq!(reading.charging_current_a, 0.1);
        assert_eq!(reading.battery_voltage_v, 12.8);
        assert_eq!(reading.charging_power_w, 50.0);
        assert_eq!(reading.charging_capacity_ah, 128.0);
        assert_eq!(reading.energy_daily_wh, 50.0);
        assert_eq!(reading.panel_voltage_v, 12.8);
        assert_eq!(fake.script().writes, 2);
        assert_eq!(fake.script().disconnects, 1);
        assert_eq!(session.state(), SessionState::Polling);
    }

    #[tokio::test(start_paused = true)]
    async fn test_every_failure_returns_to_discovering() {
        let cases: Vec<(&str, FakeTransport)> = vec![
            ("discovery_timeout", FakeTransport::with(|s| s.scans.push_back(Ok(false)))),
            ("discovery_failure", FakeTransport::with(|s| s.scans.push_back(Err(anyhow!("org.bluez.Error.NotReady"))))),
            ("connect_failure", FakeTransport::with(|s| s.connect_error = true)),
            ("subscribe_failure", FakeTransport::with(|s| s.subscribe_error = true)),
            ("write_failure", FakeTransport::default()),
            ("response_timeout", FakeTransport::with(|s| s.replies.push_back(vec![]))),
            (
                "decode_failure",
                FakeTransport::with(|s| s.replies.push_back(reply(&[b"0011280500012800005012X\n"]))),
            ),
        ];

        for (kind, fake) in cases {
            let (mut session, store, _) = new_session(&fake);
            let mut states = session.watch_state();

            let err = session.attempt().await.unwrap_err();
            assert_eq!(err.kind(), kind);

            let started = Instant::now();
            session.recover(err).await;
            assert!(started.elapsed() <= Config::default().timing.backoff());
            assert_eq!(session.state(), SessionState::Discovering);
            assert_eq!(*states.borrow_and_update(), SessionState::Discovering);
            assert_eq!(session.recovery().consecutive_failures(), 1);
            assert_eq!(store.get_last_reading(), None);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_tenth_failure_resets_radio() {
        let fake = FakeTransport::with(|s| s.scans.extend((0..10).map(|_| Ok(false))));
        let (mut session, _, reset) = new_session(&fake);

        for i in 1..=9 {
            let err = session.attempt().await.unwrap_err();
            session.recover(err).await;
            assert_eq!(session.recovery().consecutive_failures(), i);
        }
        assert_eq!(reset.calls.load(Ordering::SeqCst), 0);

        let err = session.attempt().await.unwrap_err();
        session.recover(err).await;
        assert_eq!(reset.calls.load(Ordering::SeqCst), 1);
        assert_eq!(session.recovery().consecutive_failures(), 0);
        assert_eq!(session.state(), SessionState::Discovering);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reading_clears_failure_count() {
        let fake = FakeTransport::with(|s| {
            s.scans.extend((0..3).map(|_| Ok(false)));
            s.replies.push_back(reply(&FRAME_A));
        });
        let (mut session, store, _) = new_session(&fake);

        for _ in 0..3 {
            let err = session.attempt().await.unwrap_err();
            session.recover(err).await;
        }
        assert_eq!(session.recovery().consecutive_failures(), 3);

        let err = session.attempt().await.unwrap_err();
        assert!(store.get_last_reading().is_some());
        session.recover(err).await;
        assert_eq!(session.recovery().consecutive_failures(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_one_reading_per_frame_despite_noise() {
        let fake = FakeTransport::with(|s| {
            // A stray terminator, a secondary voltage report and a corrupt chunk around frame A.
            let mut first = vec![b"\n".to_vec(), b"1280\r".to_vec(), b"\n".to_vec(), vec![0x30, 0xfe, 0x0d]];
            first.extend(reply(&FRAME_A));
            s.replies.push_back(first);
            s.replies.push_back(reply(&FRAME_B));
        });
        let (mut session, store, _) = new_session(&fake);

        session.attempt().await.unwrap_err();

        let reading = store.get_last_reading().unwrap();
        assert_eq!(reading.charging_current_a, 4.5);
        assert_eq!(reading.battery_voltage_v, 13.2);
        assert_eq!(reading.charging_power_w, 123.0);
        assert_eq!(reading.charging_capacity_ah, 76.0);
        assert_eq!(reading.energy_daily_wh, 89.0);
        assert_eq!(reading.panel_voltage_v, 18.3);
        assert_eq!(store.last_voltage_sample().map(|s| s.voltage_v), Some(12.8));
        assert_eq!(session.recovery().malformed_chunks(), 1);
        assert_eq!(fake.script().writes, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stale_subscription_errors_are_not_fatal() {
        let fake = FakeTransport::with(|s| {
            s.unsubscribe_error = true;
            s.already_subscribed = true;
            s.replies.push_back(reply(&FRAME_A));
        });
        let (mut session, store, _) = new_session(&fake);

        let err = session.attempt().await.unwrap_err();
        assert!(matches!(err, LinkError::WriteFailure(_)), "{err}");
        assert!(store.get_last_reading().is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_frame_before_poll_does_not_answer_it() {
        // Both frames arrive after the first request. The second must not satisfy the next one.
        let fake = FakeTransport::with(|s| {
            let mut first = reply(&FRAME_A);
            first.extend(reply(&FRAME_B));
            s.replies.push_back(first);
            s.replies.push_back(vec![]);
        });
        let (mut session, store, _) = new_session(&fake);

        let err = session.attempt().await.unwrap_err();
        assert_eq!(err.kind(), "response_timeout");
        assert_eq!(fake.script().writes, 2);
        assert_eq!(store.get_last_reading().unwrap().battery_voltage_v, 12.8);
    }

    #[tokio::test(start_paused = true)]
    async fn test_hung_connect_is_bounded() {
        let fake = FakeTransport::with(|s| s.connect_hangs = true);
        let (mut session, _, _) = new_session(&fake);

        let started = Instant::now();
        let err = session.attempt().await.unwrap_err();
        assert_eq!(err.kind(), "connect_failure");
        assert!(started.elapsed() <= Config::default().timing.connect_timeout() + TRANSPORT_GRACE);
        assert_eq!(session.state(), SessionState::Connecting);
    }

    #[tokio::test(start_paused = true)]
    async fn test_hung_subscribe_fails_and_disconnects() {
        let fake = FakeTransport::with(|s| s.subscribe_hangs = true);
        let (mut session, _, _) = new_session(&fake);

        let started = Instant::now();
        let err = session.attempt().await.unwrap_err();
        assert_eq!(err.kind(), "subscribe_failure");
        assert!(started.elapsed() <= Config::default().timing.subscribe_timeout() * 2);
        assert_eq!(fake.script().disconnects, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_previous_subscription_callback_is_ignored() {
        let fake = FakeTransport::with(|s| s.replies.push_back(reply(&FRAME_A)));
        let (mut session, store, _) = new_session(&fake);

        session.attempt().await.unwrap_err();
        session.attempt().await.unwrap_err();
        let callbacks = fake.script().callbacks.clone();
        assert_eq!(callbacks.len(), 2);

        let stale = &callbacks[0];
        stale(Chunk { characteristic: CharacteristicId::Handle(0x29), data: b"00128000050128\r".to_vec() });
        assert!(session.lock_buffer().pending().is_empty());

        let current = &callbacks[1];
        current(Chunk { characteristic: CharacteristicId::Handle(0x29), data: b"00128000050128\r".to_vec() });
        assert_eq!(session.lock_buffer().pending(), b"00128000050128");
        assert_eq!(store.get_last_reading().unwrap().battery_voltage_v, 12.8);
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_never_returns() {
        let fake = FakeTransport::with(|s| s.scans.extend((0..1000).map(|_| Ok(false))));
        let (mut session, _, reset) = new_session(&fake);

        let ran = timeout(Duration::from_secs(600), session.run()).await;
        assert!(ran.is_err());
        assert!(reset.calls.load(Ordering::SeqCst) >= 5);
    }
}
