//! Scan session controller.
//!
//! Drives one scan through the device lifecycle: precheck, session start
//! with busy recovery, warm-up, parameter upload, block transfer and
//! teardown. Every started session is torn down exactly once (abort, then
//! back to idle), whether it ends with the last line, an error or a cancel.

use std::sync::Arc;
use std::thread;
use std::time::Duration;

use chrono::Local;
use tracing::{debug, info, instrument, warn};

use crate::channel::CommandChannel;
use crate::config::SessionConfig;
use crate::error::{DriverError, ErrorKind, Phase, ScanError};
use crate::events::{ScanEvent, ScanObserver};
use crate::monitor::{DeviceEvent, DeviceStatus, StatusMonitor};
use crate::negotiate::ScanPlan;
use crate::pipeline::Pipeline;
use crate::pipeline::convert::gamma_table;
use crate::profile::DeviceProfile;
use crate::protocol::frame::Command;
use crate::reader::{BlockReader, ImageBlock};
use crate::request::PaperSource;
use crate::retry::{CancelToken, poll, retry};
use crate::state::{SessionMachine, SessionState};
use crate::transport::ScannerTransport;

/// Interrupt packets handled per poll.
const MAX_INTERRUPTS_PER_POLL: usize = 8;
/// Entries of the tone curve before the family table packs it.
const GAMMA_ENTRIES: usize = 4096;

pub struct SessionController<T: ScannerTransport> {
    channel: CommandChannel<T>,
    profile: DeviceProfile,
    config: SessionConfig,
    observer: Arc<dyn ScanObserver>,
    machine: SessionMachine,
    monitor: StatusMonitor,
    cancel: CancelToken,
    plan: Option<ScanPlan>,
    reader: Option<BlockReader>,
    pipeline: Option<Pipeline>,
    /// Start-session was acknowledged; teardown owes the device an abort.
    session_open: bool,
    underrun: bool,
    /// The last line was delivered and the session torn down.
    completed: bool,
    /// Interrupt requests that arrived mid-transfer, answered once idle.
    time_sync_due: bool,
    status_due: bool,
}

impl<T: ScannerTransport> SessionController<T> {
    pub fn new(
        transport: T,
        profile: DeviceProfile,
        config: SessionConfig,
        observer: Arc<dyn ScanObserver>,
    ) -> Self {
        let table = profile.command_table();
        let monitor = StatusMonitor::new(table.interrupt);
        let channel = CommandChannel::new(transport, table, config.response_policy());
        Self {
            channel,
            profile,
            config,
            observer,
            machine: SessionMachine::new(),
            monitor,
            cancel: CancelToken::new(),
            plan: None,
            reader: None,
            pipeline: None,
            session_open: false,
            underrun: false,
            completed: false,
            time_sync_due: false,
            status_due: false,
        }
    }

    pub fn state(&self) -> SessionState {
        self.machine.state()
    }

    pub fn profile(&self) -> &DeviceProfile {
        &self.profile
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    pub fn transport(&self) -> &T {
        self.channel.transport()
    }

    /// Handle for cancelling from another thread.
    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    /// Request cancellation. Honored before the next blocking call.
    pub fn cancel(&self) {
        info!("Cancel requested");
        self.cancel.cancel();
    }

    /// Lines handed out for the current scan, padding included.
    pub fn lines_delivered(&self) -> u64 {
        self.pipeline.as_ref().map_or(0, Pipeline::emitted)
    }

    /// Open a session on the device and upload the scan parameters.
    ///
    /// A second start while a session is active fails with `Busy` and
    /// leaves the running session alone.
    #[instrument(skip_all, fields(model = %self.profile.model))]
    pub fn start(&mut self, plan: &ScanPlan) -> Result<(), ScanError> {
        if self.machine.state() != SessionState::Idle {
            return Err(ScanError::new(Phase::Start, DriverError::Busy));
        }
        self.cancel.reset();
        self.plan = Some(plan.clone());
        self.reader = None;
        self.pipeline = None;
        self.underrun = false;
        self.completed = false;

        match self.run_start(plan) {
            Ok(()) => Ok(()),
            Err(e) => Err(self.fail(Phase::Start, e)),
        }
    }

    fn run_start(&mut self, plan: &ScanPlan) -> Result<(), DriverError> {
        let cancel = self.cancel.clone();
        let source = plan.request.source;
        let tpu = source == PaperSource::Tpu;

        self.poll_interrupts();
        if source.is_feeder() {
            self.wait_for_paper(&cancel)?;
        } else {
            self.query_status(&cancel)?;
        }

        self.goto(SessionState::Warmup)?;
        self.open_session(tpu, &cancel)?;
        self.calibrate(tpu, &cancel)?;
        self.upload_parameters(plan, &cancel)?;
        self.goto(SessionState::Scanning)?;

        self.reader = Some(BlockReader::new(self.channel.table().block));
        self.pipeline = Some(Pipeline::new(plan));
        info!(
            source = %source,
            dpi = plan.geometry.xdpi,
            width = plan.geometry.width,
            height = plan.geometry.height,
            raw_lines = plan.geometry.raw_height,
            "Scan started"
        );
        Ok(())
    }

    /// Sheet feeders: wait a bounded number of polls for a document.
    fn wait_for_paper(&mut self, cancel: &CancelToken) -> Result<(), DriverError> {
        let policy = self.config.paper_policy();
        let found = poll(&policy, cancel, "paper", |_| {
            Ok(self.query_status(cancel)?.paper_present.then_some(()))
        })?;
        if found.is_none() {
            warn!(polls = policy.max_retries + 1, "No document in the feeder");
            return Err(DriverError::NoPaper);
        }
        Ok(())
    }

    fn open_session(&mut self, tpu: bool, cancel: &CancelToken) -> Result<(), DriverError> {
        let cmd = self.channel.table().start_session(tpu);
        let policy = self.config.busy_policy();
        let channel = &self.channel;
        let first = retry(
            &policy,
            cancel,
            "start session",
            |e| e.kind() == ErrorKind::Busy,
            |_| channel.exec(&cmd, cancel),
        );

        match first {
            Ok(_) => {}
            Err(e) if matches!(e.kind(), ErrorKind::Busy | ErrorKind::Timeout) => {
                // A device left mid-session by a previous host only starts
                // again after the stale session is aborted.
                warn!(error = %e, "Session start failed, aborting the stale session");
                self.channel.drain(self.config.drain_max_reads);
                let abort = self.channel.table().abort_session();
                if let Err(abort_err) = self.channel.exec(&abort, &CancelToken::new()) {
                    debug!(error = %abort_err, "Recovery abort refused");
                }
                pause(self.config.hang_recovery_delay());
                cancel.check()?;
                self.channel.exec(&cmd, cancel)?;
            }
            Err(e) => return Err(e),
        }
        self.session_open = true;
        Ok(())
    }

    /// Warm-up of CCD models: photometric calibration and, for film, the
    /// transparency lamp. Contact sensors need neither.
    fn calibrate(&mut self, tpu: bool, cancel: &CancelToken) -> Result<(), DriverError> {
        if !self.profile.needs_calibration() {
            return Ok(());
        }

        let calibration = self.channel.table().calibration;
        if let Some(cal) = calibration {
            self.query_status(cancel)?;
            self.query_status(cancel)?;
            self.channel
                .exec(&Command::new(cal.start).with_flag(cal.start_flag), cancel)?;

            if tpu {
                let query = cal.lamp_poll.command();
                let channel = &self.channel;
                let lit = poll(&self.config.lamp_policy(), cancel, "lamp", |_| {
                    let data = channel.exec(&query, cancel)?;
                    Ok(cal.lamp_ready.matches(&data).then_some(()))
                })?;
                if lit.is_none() {
                    return Err(DriverError::Timeout("transparency lamp not ready".into()));
                }
                self.dispatch(DeviceEvent::LampReady);
            }
        }

        let ready = self.channel.table().ready;
        let via_status = ready.query == self.channel.table().status;
        let policy = self.config.calibration_policy();
        let done = poll(&policy, cancel, "calibration", |attempt| {
            if attempt > 0 {
                self.poll_interrupts();
            }
            if via_status {
                return Ok(self.query_status(cancel)?.calibrated.then_some(()));
            }
            let data = self.channel.exec(&ready.query.command(), cancel)?;
            Ok(ready.ready.matches(&data).then_some(()))
        })?;
        if done.is_none() {
            return Err(DriverError::Timeout("calibration did not finish".into()));
        }
        debug!("Calibration done");
        Ok(())
    }

    fn upload_parameters(&mut self, plan: &ScanPlan, cancel: &CancelToken) -> Result<(), DriverError> {
        let table = self.channel.table();
        let source = plan.request.source;

        if let Some(cmd) = table.select_source(source) {
            self.channel.exec(&cmd, cancel)?;
        }

        if source != PaperSource::Tpu
            && let Some(upload) = table.gamma
        {
            let gamma = plan.request.gamma.unwrap_or(self.config.gamma);
            let lut = gamma_table(gamma, GAMMA_ENTRIES);
            if let Some(cmd) = table.gamma(&lut, plan.geometry.raw_channels) {
                for _ in 0..upload.repeat.max(1) {
                    self.channel.exec(&cmd, cancel)?;
                }
            }
        }

        self.channel.exec(&table.scan_param(&plan.params), cancel)?;

        if let Some(cmd) = table.begin_transfer(source == PaperSource::Tpu) {
            self.channel.exec(&cmd, cancel)?;
        }
        Ok(())
    }

    /// Next corrected scanline; `None` once the image is complete.
    ///
    /// The call that returns `None` also tears the session down.
    pub fn next_line(&mut self) -> Result<Option<Vec<u8>>, ScanError> {
        if self.completed {
            return Ok(None);
        }
        let complete = self.pipeline.as_ref().map(Pipeline::is_complete);
        match (self.machine.state(), complete) {
            (_, Some(true)) => {
                self.complete()?;
                return Ok(None);
            }
            (SessionState::Scanning | SessionState::Transferring, Some(false)) => {}
            (state, _) => {
                return Err(ScanError::new(
                    Phase::Transfer,
                    DriverError::InvalidState(format!("no image data in state {state}")),
                ));
            }
        }

        match self.fill() {
            Ok(line) => {
                if let Some(pipeline) = &self.pipeline {
                    self.observer.on_event(&ScanEvent::Progress {
                        lines: pipeline.emitted(),
                        total: pipeline.height(),
                    });
                }
                Ok(Some(line))
            }
            Err(e) => Err(self.fail(Phase::Transfer, e)),
        }
    }

    /// Read blocks until the pipeline can produce a line.
    fn fill(&mut self) -> Result<Vec<u8>, DriverError> {
        let cancel = self.cancel.clone();
        loop {
            cancel.check()?;
            if let Some(line) = self.take_line()? {
                return Ok(line);
            }

            if self.machine.state() == SessionState::Scanning {
                self.goto(SessionState::Transferring)?;
            }
            let block = self.read_block(&cancel)?;
            self.observer.on_event(&ScanEvent::Block {
                len: block.data.len(),
                flags: block.flags.bits(),
            });

            if block.is_pending() {
                pause(self.config.empty_block_delay());
                self.poll_interrupts();
                continue;
            }
            if let Some(pipeline) = self.pipeline.as_mut() {
                pipeline.push(&block.data);
            }
        }
    }

    /// A line from buffered data, or padding once the device has ended
    /// the image.
    fn take_line(&mut self) -> Result<Option<Vec<u8>>, DriverError> {
        let Some(pipeline) = self.pipeline.as_mut() else {
            return Ok(None);
        };
        if let Some(line) = pipeline.next_line()? {
            return Ok(Some(line));
        }
        if !self.reader.as_ref().is_some_and(BlockReader::is_end_of_image) {
            return Ok(None);
        }
        if !self.underrun {
            warn!(
                delivered = pipeline.emitted(),
                expected = pipeline.height(),
                "Image ended early, padding"
            );
            self.underrun = true;
        }
        Ok(pipeline.pad_line())
    }

    fn read_block(&mut self, cancel: &CancelToken) -> Result<ImageBlock, DriverError> {
        let reader = self
            .reader
            .as_mut()
            .ok_or_else(|| DriverError::InvalidState("no block reader".into()))?;
        match reader.read_block(&self.channel, cancel) {
            // The device refused the read rather than us cancelling.
            Err(DriverError::Cancelled) if !cancel.is_cancelled() => {
                read_error_info(&self.channel);
                Err(DriverError::Cancelled)
            }
            other => other,
        }
    }

    /// Tear down the session if one is running. Safe to call repeatedly.
    pub fn finish(&mut self) -> Result<(), ScanError> {
        self.teardown()
            .map_err(|e| ScanError::new(Phase::Teardown, e))
    }

    fn complete(&mut self) -> Result<(), ScanError> {
        if self.machine.state() == SessionState::Idle {
            return Ok(());
        }
        let lines = self.lines_delivered();
        self.completed = true;
        let res = self.finish();
        self.observer.on_event(&ScanEvent::Complete { lines });
        res
    }

    fn fail(&mut self, phase: Phase, err: DriverError) -> ScanError {
        warn!(phase = %phase, error = %err, "Scan failed");
        self.observer.on_event(&ScanEvent::Error {
            phase,
            kind: err.kind(),
            message: err.to_string(),
        });
        if let Err(e) = self.teardown() {
            warn!(error = %e, "Teardown after failure failed");
        }
        ScanError::new(phase, err)
    }

    fn teardown(&mut self) -> Result<(), DriverError> {
        let state = self.machine.state();
        if state == SessionState::Idle {
            return Ok(());
        }
        if state.is_active() {
            self.goto(SessionState::Finished)?;
        }
        if self.reader.as_ref().is_some_and(BlockReader::is_outstanding) {
            self.channel.drain(self.config.drain_max_reads);
        }

        let mut result = Ok(());
        if self.session_open {
            self.session_open = false;
            let abort = self.channel.table().abort_session();
            // Teardown traffic is never cancelled.
            result = self.channel.exec(&abort, &CancelToken::new()).map(|_| ());
            if let Err(e) = &result {
                warn!(error = %e, "Abort failed");
            }
        }
        self.goto(SessionState::Idle)?;
        self.reader = None;
        self.pipeline = None;
        self.answer_deferred();
        result
    }

    /// Time sync and status queries postponed while blocks were flowing.
    fn answer_deferred(&mut self) {
        if std::mem::take(&mut self.time_sync_due)
            && let Err(e) = self.send_time()
        {
            debug!(error = %e, "Deferred time sync failed");
        }
        if std::mem::take(&mut self.status_due)
            && let Err(e) = self.fetch_status(&CancelToken::new())
        {
            debug!(error = %e, "Deferred status query failed");
        }
    }

    fn goto(&mut self, to: SessionState) -> Result<(), DriverError> {
        let from = self.machine.goto_state(to)?;
        self.observer.on_event(&ScanEvent::StateChanged { from, to });
        Ok(())
    }

    /// Query and decode the general status without judging it.
    ///
    /// Fails with `Busy` while a session is open; the device takes no
    /// commands besides image reads then.
    pub fn status(&mut self) -> Result<DeviceStatus, DriverError> {
        if self.machine.state() != SessionState::Idle {
            return Err(DriverError::Busy);
        }
        self.fetch_status(&CancelToken::new())
    }

    fn fetch_status(&mut self, cancel: &CancelToken) -> Result<DeviceStatus, DriverError> {
        let cmd = self.channel.table().status_query();
        let data = self.channel.exec(&cmd, cancel)?;
        let duplex = self
            .plan
            .as_ref()
            .is_some_and(|p| p.request.source == PaperSource::AdfDuplex);
        let status = DeviceStatus::decode(&self.channel.table().status_layout, &data, duplex);
        for event in self.monitor.observe(status.clone()) {
            self.dispatch(event);
        }
        Ok(status)
    }

    /// Status query that fails on conditions needing the user.
    fn query_status(&mut self, cancel: &CancelToken) -> Result<DeviceStatus, DriverError> {
        let status = self.fetch_status(cancel)?;
        match status.fault() {
            Some(fault) => Err(fault),
            None => Ok(status),
        }
    }

    /// Handle whatever the interrupt channel has queued. Only called
    /// between command transactions.
    pub fn poll_interrupts(&mut self) {
        let len = self.channel.table().interrupt.read_len;
        for _ in 0..MAX_INTERRUPTS_PER_POLL {
            match self
                .channel
                .transport()
                .read_interrupt(len, self.config.interrupt_poll())
            {
                Ok(Some(packet)) => {
                    if let Err(e) = self.handle_interrupt(&packet) {
                        debug!(error = %e, "Interrupt not handled");
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    debug!(error = %e, "Interrupt read failed");
                    break;
                }
            }
        }
    }

    /// Next device event, waiting up to `timeout` on the interrupt channel.
    pub fn wait_event(&mut self, timeout: Duration) -> Result<Option<DeviceEvent>, DriverError> {
        if let Some(event) = self.monitor.next_event() {
            return Ok(Some(event));
        }
        let len = self.channel.table().interrupt.read_len;
        if let Some(packet) = self.channel.transport().read_interrupt(len, timeout)? {
            self.handle_interrupt(&packet)?;
        }
        Ok(self.monitor.next_event())
    }

    fn handle_interrupt(&mut self, packet: &[u8]) -> Result<(), DriverError> {
        let transferring = self.machine.state().can_read();
        for event in self.monitor.decode_packet(packet)? {
            match event {
                DeviceEvent::TimeSyncRequested if transferring => {
                    debug!("Time sync deferred until the scan ends");
                    self.time_sync_due = true;
                }
                DeviceEvent::StatusChanged if transferring => self.status_due = true,
                DeviceEvent::TimeSyncRequested => self.send_time()?,
                DeviceEvent::StatusChanged => {
                    self.fetch_status(&CancelToken::new())?;
                }
                _ => {}
            }
            self.dispatch(event);
        }
        Ok(())
    }

    fn send_time(&self) -> Result<(), DriverError> {
        if !self.config.time_sync {
            return Ok(());
        }
        let now = Local::now().naive_local();
        if let Some(cmd) = self.channel.table().time_sync(now) {
            debug!(time = %now.format("%y/%m/%d %H:%M"), "Sending time");
            self.channel.exec(&cmd, &CancelToken::new())?;
        }
        Ok(())
    }

    fn dispatch(&mut self, event: DeviceEvent) {
        self.observer.on_event(&ScanEvent::Device(event));
        self.monitor.queue(event);
    }
}

fn read_error_info<T: ScannerTransport>(channel: &CommandChannel<T>) {
    let Some(cmd) = channel.table().error_info() else {
        return;
    };
    match channel.exec(&cmd, &CancelToken::new()) {
        Ok(info) => warn!(info = ?info, "Device cancelled the transfer"),
        Err(e) => debug!(error = %e, "Error info unavailable"),
    }
}

fn pause(delay: Duration) {
    if !delay.is_zero() {
        thread::sleep(delay);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::testing::RecordingObserver;
    use crate::negotiate::resolve;
    use crate::protocol::constants::*;
    use crate::protocol::frame::{FrameLayout, encode_block, encode_response};
    use crate::protocol::frame::BlockLayout;
    use crate::protocol::status::StatusCode;
    use crate::request::{ColorMode, ScanArea, ScanRequest};
    use crate::transport::MockTransport;
    use byteorder::{BigEndian, ByteOrder};

    fn reply(mock: &MockTransport, status: StatusCode, data: &[u8]) {
        mock.queue_reply(&encode_response(&FrameLayout::default(), status, data));
    }

    fn ok(mock: &MockTransport) {
        reply(mock, StatusCode::OK, &[]);
    }

    fn status_record(mock: &MockTransport, len: usize, paper: bool) {
        let mut record = vec![0u8; len];
        record[1] = (!paper) as u8;
        reply(mock, StatusCode::OK, &record);
    }

    fn config() -> SessionConfig {
        SessionConfig {
            busy_retries: 2,
            paper_polls: 3,
            ..SessionConfig::default().without_delays()
        }
    }

    fn controller(
        model: &str,
        mock: &MockTransport,
    ) -> (SessionController<MockTransport>, Arc<RecordingObserver>) {
        let observer = Arc::new(RecordingObserver::default());
        let profile = DeviceProfile::find(model).unwrap();
        let session = SessionController::new(mock.clone(), profile, config(), observer.clone());
        (session, observer)
    }

    /// MP150, 16x16 color at 75 dpi: 48-byte lines, no lead-in.
    fn small_plan() -> ScanPlan {
        let profile = DeviceProfile::find("MP150").unwrap();
        let request = ScanRequest::new(
            75,
            ScanArea::new(0, 0, 16, 16),
            ColorMode::Color,
            PaperSource::Flatbed,
        );
        resolve(&request, &profile).unwrap()
    }

    /// Replies for the MP150 start sequence: status, start, source,
    /// gamma, parameters.
    fn queue_start(mock: &MockTransport) {
        status_record(mock, 12, true);
        for _ in 0..4 {
            ok(mock);
        }
    }

    #[test]
    fn test_start_sequence() {
        let mock = MockTransport::new();
        let (mut session, observer) = controller("MP150", &mock);
        queue_start(&mock);
        session.start(&small_plan()).unwrap();

        assert_eq!(session.state(), SessionState::Scanning);
        assert_eq!(
            mock.opcodes(),
            vec![CMD_STATUS, CMD_START_SESSION, CMD_SELECT_SOURCE, CMD_GAMMA, CMD_SCAN_PARAM]
        );
        assert_eq!(
            observer.states(),
            vec![SessionState::Warmup, SessionState::Scanning]
        );
    }

    #[test]
    fn test_second_start_is_busy() {
        let mock = MockTransport::new();
        let (mut session, _) = controller("MP150", &mock);
        queue_start(&mock);
        let plan = small_plan();
        session.start(&plan).unwrap();
        mock.clear_writes();

        let err = session.start(&plan).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Busy);
        assert_eq!(err.phase, Phase::Start);
        assert!(mock.get_writes().is_empty());
        assert_eq!(session.state(), SessionState::Scanning);
    }

    #[test]
    fn test_busy_forever_terminates() {
        let mock = MockTransport::new();
        let (mut session, _) = controller("MP150", &mock);
        status_record(&mock, 12, true);
        let busy = encode_response(&FrameLayout::default(), StatusCode::BUSY, &[]);
        mock.set_fallback(&busy);

        let err = session.start(&small_plan()).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Busy);
        assert_eq!(err.phase, Phase::Start);
        // Three attempts, then one more after the recovery abort.
        assert_eq!(mock.count_opcode(CMD_START_SESSION), 4);
        assert_eq!(mock.count_opcode(CMD_ABORT_SESSION), 1);
        assert_eq!(session.state(), SessionState::Idle);
    }

    #[test]
    fn test_wedged_device_recovers() {
        let mock = MockTransport::new();
        let (mut session, _) = controller("MP150", &mock);
        status_record(&mock, 12, true);
        for _ in 0..3 {
            reply(&mock, StatusCode::BUSY, &[]);
        }
        // Drain finds nothing queued.
        mock.queue_timeout();
        ok(&mock); // abort
        for _ in 0..4 {
            ok(&mock); // start, source, gamma, parameters
        }
        session.start(&small_plan()).unwrap();
        assert_eq!(session.state(), SessionState::Scanning);
        assert_eq!(mock.count_opcode(CMD_START_SESSION), 4);
        assert_eq!(mock.count_opcode(CMD_ABORT_SESSION), 1);
    }

    #[test]
    fn test_no_paper_after_polls() {
        let mock = MockTransport::new();
        let (mut session, _) = controller("MX850", &mock);
        let profile = DeviceProfile::find("MX850").unwrap();
        let request = ScanRequest::new(150, ScanArea::new(0, 0, 100, 100), ColorMode::Color, PaperSource::Adf);
        let plan = resolve(&request, &profile).unwrap();
        for _ in 0..4 {
            status_record(&mock, 16, false);
        }

        let err = session.start(&plan).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NoPaper);
        assert_eq!(err.phase, Phase::Start);
        assert_eq!(mock.count_opcode(CMD_STATUS), 4);
        assert_eq!(mock.count_opcode(CMD_START_SESSION), 0);
        assert_eq!(mock.count_opcode(CMD_ABORT_SESSION), 0);
    }

    #[test]
    fn test_paper_arrives_during_polls() {
        let mock = MockTransport::new();
        let (mut session, _) = controller("MX850", &mock);
        let profile = DeviceProfile::find("MX850").unwrap();
        let request = ScanRequest::new(150, ScanArea::new(0, 0, 100, 100), ColorMode::Color, PaperSource::Adf);
        let plan = resolve(&request, &profile).unwrap();
        status_record(&mock, 16, false);
        status_record(&mock, 16, true);
        for _ in 0..4 {
            ok(&mock);
        }
        session.start(&plan).unwrap();
        assert_eq!(mock.count_opcode(CMD_STATUS), 2);
    }

    #[test]
    fn test_cancel_reads_once_and_aborts_once() {
        let mock = MockTransport::new();
        let (mut session, _) = controller("MP150", &mock);
        queue_start(&mock);
        session.start(&small_plan()).unwrap();

        mock.queue_reply(&encode_block(&BlockLayout::default(), StatusCode::OK, 0, &[7u8; 96]));
        assert_eq!(session.next_line().unwrap().unwrap().len(), 48);
        assert_eq!(session.state(), SessionState::Transferring);

        session.cancel();
        ok(&mock); // abort
        let reads = mock.read_count();
        let read_images = mock.count_opcode(CMD_READ_IMAGE);

        let err = session.next_line().unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Cancelled);
        assert_eq!(err.phase, Phase::Transfer);
        assert!(mock.read_count() - reads <= 1);
        assert_eq!(mock.count_opcode(CMD_READ_IMAGE), read_images);
        assert_eq!(mock.count_opcode(CMD_ABORT_SESSION), 1);

        session.finish().unwrap();
        assert_eq!(mock.count_opcode(CMD_ABORT_SESSION), 1);
        assert_eq!(session.state(), SessionState::Idle);
    }

    #[test]
    fn test_corrupt_block_length_tears_down_once() {
        let mock = MockTransport::new();
        let (mut session, observer) = controller("MP150", &mock);
        queue_start(&mock);
        session.start(&small_plan()).unwrap();

        let mut block = encode_block(&BlockLayout::default(), StatusCode::OK, 0, &[1u8; 100]);
        BigEndian::write_u32(&mut block[BLOCK_SIZE_OFFSET..], 4096);
        mock.queue_reply(&block);
        ok(&mock); // abort

        let err = session.next_line().unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Protocol);
        assert_eq!(err.phase, Phase::Transfer);
        assert_eq!(session.state(), SessionState::Idle);

        session.finish().unwrap();
        assert_eq!(mock.count_opcode(CMD_ABORT_SESSION), 1);
        assert_eq!(
            observer.states(),
            vec![
                SessionState::Warmup,
                SessionState::Scanning,
                SessionState::Transferring,
                SessionState::Finished,
                SessionState::Idle
            ]
        );
    }

    #[test]
    fn test_device_failed_status_reads_error_info() {
        let mock = MockTransport::new();
        let (mut session, _) = controller("MP150", &mock);
        queue_start(&mock);
        session.start(&small_plan()).unwrap();

        reply(&mock, StatusCode::FAILED, &[]);
        reply(&mock, StatusCode::OK, &[0u8; ERROR_INFO_LEN]);
        ok(&mock); // abort

        let err = session.next_line().unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Cancelled);
        assert_eq!(mock.count_opcode(CMD_ERROR_INFO), 1);
        assert_eq!(mock.count_opcode(CMD_ABORT_SESSION), 1);
    }

    #[test]
    fn test_empty_blocks_then_short_image_padded() {
        let mock = MockTransport::new();
        let (mut session, _) = controller("MP150", &mock);
        queue_start(&mock);
        session.start(&small_plan()).unwrap();

        let layout = BlockLayout::default();
        mock.queue_reply(&encode_block(&layout, StatusCode::OK, 0, &[]));
        mock.queue_reply(&encode_block(&layout, StatusCode::OK, 0x20, &[9u8; 48 * 3]));
        mock.queue_reply(&encode_block(&layout, StatusCode::OK, 0x28, &[]));
        ok(&mock); // abort

        let mut lines = Vec::new();
        while let Some(line) = session.next_line().unwrap() {
            lines.push(line);
        }
        assert_eq!(lines.len(), 16);
        assert_eq!(lines[2], vec![9u8; 48]);
        assert_eq!(lines[3], vec![0xFF; 48]);
        assert_eq!(mock.count_opcode(CMD_READ_IMAGE), 3);
        assert_eq!(mock.count_opcode(CMD_ABORT_SESSION), 1);
        assert_eq!(session.state(), SessionState::Idle);
        // Finished sessions stay finished.
        assert!(session.next_line().unwrap().is_none());
    }

    #[test]
    fn test_interrupt_button_and_time_sync() {
        let mock = MockTransport::new();
        let (mut session, observer) = controller("MP150", &mock);
        let mut packet = [0u8; 16];
        packet[0] = 0x02;
        packet[1] = 0x01;
        packet[3] = 0x01;
        mock.queue_interrupt(&packet);
        ok(&mock); // time

        let event = session.wait_event(Duration::ZERO).unwrap();
        assert_eq!(mock.opcodes(), vec![CMD_TIME]);
        assert_eq!(event, Some(DeviceEvent::TimeSyncRequested));
        assert!(matches!(
            session.wait_event(Duration::ZERO).unwrap(),
            Some(DeviceEvent::Button { button: 2, target: 1, .. })
        ));
        assert_eq!(session.wait_event(Duration::ZERO).unwrap(), None);
        let devices = observer
            .events
            .lock()
            .unwrap()
            .iter()
            .filter(|e| matches!(e, ScanEvent::Device(_)))
            .count();
        assert_eq!(devices, 2);
    }

    #[test]
    fn test_interrupts_during_transfer_answered_after_teardown() {
        let mock = MockTransport::new();
        let (mut session, observer) = controller("MP150", &mock);
        queue_start(&mock);
        session.start(&small_plan()).unwrap();
        let started = mock.opcodes().len();

        let layout = BlockLayout::default();
        let mut packet = [0u8; 16];
        packet[3] = 0x01;
        packet[9] = 0x02;
        mock.queue_reply(&encode_block(&layout, StatusCode::OK, 0, &[]));
        mock.queue_interrupt(&packet);
        mock.queue_reply(&encode_block(&layout, StatusCode::OK, 0, &[5u8; 96]));

        assert_eq!(session.next_line().unwrap().unwrap(), vec![5u8; 48]);
        assert_eq!(mock.opcodes()[started..], [CMD_READ_IMAGE, CMD_READ_IMAGE]);
        assert!(matches!(session.status(), Err(DriverError::Busy)));
        assert_eq!(
            session.wait_event(Duration::ZERO).unwrap(),
            Some(DeviceEvent::TimeSyncRequested)
        );
        assert_eq!(mock.opcodes().len(), started + 2);

        ok(&mock); // abort
        ok(&mock); // time
        status_record(&mock, 12, true);
        session.finish().unwrap();
        assert_eq!(
            mock.opcodes()[started + 2..],
            [CMD_ABORT_SESSION, CMD_TIME, CMD_STATUS]
        );
        assert_eq!(session.state(), SessionState::Idle);
        assert!(observer.states().ends_with(&[SessionState::Finished, SessionState::Idle]));
    }

    #[test]
    fn test_buffers_released_at_idle() {
        let mock = MockTransport::new();
        let (mut session, _) = controller("MP150", &mock);
        queue_start(&mock);
        session.start(&small_plan()).unwrap();
        mock.queue_reply(&encode_block(&BlockLayout::default(), StatusCode::OK, 0, &[1u8; 96]));
        session.next_line().unwrap().unwrap();
        assert_eq!(session.lines_delivered(), 1);

        ok(&mock); // abort
        session.finish().unwrap();
        assert!(session.pipeline.is_none());
        assert!(session.reader.is_none());
        assert_eq!(session.lines_delivered(), 0);
    }

    #[test]
    fn test_next_line_before_start() {
        let mock = MockTransport::new();
        let (mut session, _) = controller("MP150", &mock);
        let err = session.next_line().unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidState);
        assert!(mock.get_writes().is_empty());
    }
}
