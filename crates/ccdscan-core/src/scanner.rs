//! Caller-facing scanner handle.
//!
//! Wraps a [`SessionController`] with request negotiation and phase-tagged
//! errors. Dropping a `Scanner` mid-scan tears the session down.

use std::sync::Arc;
use std::time::Duration;

use tracing::{info, instrument, warn};

use crate::config::SessionConfig;
use crate::error::{DriverError, Phase, PhaseExt, ScanError};
use crate::events::{ScanEvent, ScanObserver, TracingObserver};
use crate::monitor::{DeviceEvent, DeviceStatus};
use crate::negotiate::{OutputFormat, RawGeometry, ScanPlan, resolve};
use crate::profile::DeviceProfile;
use crate::request::ScanRequest;
use crate::retry::CancelToken;
use crate::session::SessionController;
use crate::state::SessionState;
use crate::transport::{NusbTransport, ObservedTransport, ScannerTransport, TransportError, UsbTimeouts};

pub struct Scanner<T: ScannerTransport> {
    session: SessionController<ObservedTransport<T>>,
    plan: Option<ScanPlan>,
}

impl Scanner<NusbTransport> {
    /// Open the USB device a profile describes.
    pub fn open_usb(
        profile: DeviceProfile,
        config: SessionConfig,
        observer: Arc<dyn ScanObserver>,
    ) -> Result<Self, ScanError> {
        let timeouts = UsbTimeouts {
            write: config.usb_timeout(),
            read: config.usb_timeout(),
        };
        let transport = NusbTransport::open_with_ids(profile.vendor_id, profile.product_id, timeouts)
            .in_phase(Phase::Open)?;
        Self::with_observer(transport, profile, config, observer)
    }
}

impl<T: ScannerTransport> Scanner<T> {
    /// Open a scanner that logs its events through `tracing`.
    pub fn open(transport: T, profile: DeviceProfile, config: SessionConfig) -> Result<Self, ScanError> {
        Self::with_observer(transport, profile, config, Arc::new(TracingObserver))
    }

    #[instrument(skip_all, fields(model = %profile.model))]
    pub fn with_observer(
        transport: T,
        profile: DeviceProfile,
        config: SessionConfig,
        observer: Arc<dyn ScanObserver>,
    ) -> Result<Self, ScanError> {
        if !transport.is_connected() {
            return Err(ScanError::new(
                Phase::Open,
                DriverError::Transport(TransportError::Disconnected),
            ));
        }
        let (vid, pid) = (transport.vendor_id(), transport.product_id());
        if (vid, pid) != (profile.vendor_id, profile.product_id) {
            warn!(
                vid = %format!("{:04X}", vid),
                pid = %format!("{:04X}", pid),
                expected_pid = %format!("{:04X}", profile.product_id),
                "Device ids do not match the profile"
            );
        }
        observer.on_event(&ScanEvent::DeviceOpened {
            vid,
            pid,
            model: profile.model.clone(),
        });

        let transport = ObservedTransport::new(transport, observer.clone());
        Ok(Self {
            session: SessionController::new(transport, profile, config, observer),
            plan: None,
        })
    }

    /// Negotiate `request` against the model and keep the result for the
    /// next [`start`](Self::start).
    pub fn configure(&mut self, request: &ScanRequest) -> Result<RawGeometry, ScanError> {
        if self.session.state().is_active() {
            return Err(ScanError::new(Phase::Negotiate, DriverError::Busy));
        }
        let plan = resolve(request, self.session.profile()).in_phase(Phase::Negotiate)?;
        info!(
            source = %plan.request.source,
            dpi = plan.geometry.xdpi,
            width = plan.geometry.width,
            height = plan.geometry.height,
            "Scan configured"
        );
        let geometry = plan.geometry;
        self.plan = Some(plan);
        Ok(geometry)
    }

    pub fn plan(&self) -> Option<&ScanPlan> {
        self.plan.as_ref()
    }

    /// Format of the lines [`next_line`](Self::next_line) returns.
    pub fn output_format(&self) -> Option<OutputFormat> {
        self.plan.as_ref().map(|p| p.output)
    }

    pub fn start(&mut self) -> Result<(), ScanError> {
        let plan = self.plan.as_ref().ok_or_else(|| {
            ScanError::new(Phase::Start, DriverError::InvalidState("scan not configured".into()))
        })?;
        self.session.start(plan)
    }

    pub fn next_line(&mut self) -> Result<Option<Vec<u8>>, ScanError> {
        self.session.next_line()
    }

    /// Iterate the remaining lines. Stops after the last line or the first
    /// error.
    pub fn lines(&mut self) -> Lines<'_, T> {
        Lines {
            scanner: self,
            done: false,
        }
    }

    /// Request cancellation of the running scan.
    pub fn cancel(&self) {
        self.session.cancel();
    }

    pub fn cancel_token(&self) -> CancelToken {
        self.session.cancel_token()
    }

    pub fn status(&mut self) -> Result<DeviceStatus, DriverError> {
        self.session.status()
    }

    pub fn wait_event(&mut self, timeout: Duration) -> Result<Option<DeviceEvent>, DriverError> {
        self.session.wait_event(timeout)
    }

    pub fn state(&self) -> SessionState {
        self.session.state()
    }

    pub fn profile(&self) -> &DeviceProfile {
        self.session.profile()
    }

    pub fn transport(&self) -> &T {
        self.session.transport().inner()
    }

    /// End any running scan and release the device.
    pub fn close(mut self) -> Result<(), ScanError> {
        self.session.finish()
    }
}

impl<T: ScannerTransport> Drop for Scanner<T> {
    fn drop(&mut self) {
        if self.session.state() != SessionState::Idle
            && let Err(e) = self.session.finish()
        {
            warn!(error = %e, "Teardown on drop failed");
        }
    }
}

pub struct Lines<'a, T: ScannerTransport> {
    scanner: &'a mut Scanner<T>,
    done: bool,
}

impl<T: ScannerTransport> Iterator for Lines<'_, T> {
    type Item = Result<Vec<u8>, ScanError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        match self.scanner.next_line() {
            Ok(Some(line)) => Some(Ok(line)),
            Ok(None) => {
                self.done = true;
                None
            }
            Err(e) => {
                self.done = true;
                Some(Err(e))
            }
        }
    }
}
