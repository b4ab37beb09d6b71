//! Session controller: owns one probe transport and, once connected, the
//! protocol engine bound to it. Exposes the coarse operations a shell needs
//! and renders their results as text.

pub mod classify;
pub mod config;

use cmsisdebug_common::{DescriptorStrings, Transport, TransportError};
use cmsisdebug_engine::adi::ap;
use cmsisdebug_engine::cortex_m::{CoreRegister, CoreStatus, CpuIdentity};
use cmsisdebug_engine::{Dap, DapError};

pub use classify::{ProbeClassifier, VendorAllowList};
pub use config::SessionConfig;

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("a probe is already open, disconnect first")]
    AlreadyOpen,
    #[error("no probe is open")]
    NotOpen,
    #[error("not connected to a target")]
    NotConnected,
    #[error("probe reports a zero packet size")]
    ZeroPacketSize,
    #[error("{vendor_id:04x}:{product_id:04x} is not a known CMSIS-DAP probe")]
    NotAProbe { vendor_id: u16, product_id: u16 },
    #[error(transparent)]
    Dap(#[from] DapError),
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error("configuration: {0}")]
    Config(String),
}

/// The opened USB side of a session
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ProbeConnection {
    pub vendor_id: u16,
    pub product_id: u16,
    pub strings: Option<DescriptorStrings>,
    pub packet_size: usize,
}

impl std::fmt::Display for ProbeConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if let Some(strings) = &self.strings {
            write!(f, "{strings} ")?;
        }
        write!(f, "({:04x}:{:04x})", self.vendor_id, self.product_id)
    }
}

enum State<T> {
    Closed,
    Open {
        transport: T,
        connection: ProbeConnection,
    },
    Connected {
        dap: Dap<T>,
        connection: ProbeConnection,
    },
}

pub struct Session<T> {
    state: State<T>,
    classifier: Box<dyn ProbeClassifier>,
    config: SessionConfig,
}

impl<T: Transport> Session<T> {
    pub fn new(config: SessionConfig) -> Self {
        let classifier = VendorAllowList::new(config.probe.allowed_vendors.clone());
        Self {
            state: State::Closed,
            classifier: Box::new(classifier),
            config,
        }
    }

    /// Replaces the vendor allow-list with another probe detection rule
    pub fn with_classifier(mut self, classifier: impl ProbeClassifier + 'static) -> Self {
        self.classifier = Box::new(classifier);
        self
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    pub fn detect_probe(&self, transport: &T) -> bool {
        self.classifier.classify_descriptor(&transport.descriptor())
    }

    pub fn connection(&self) -> Option<&ProbeConnection> {
        match &self.state {
            State::Closed => None,
            State::Open { connection, .. } | State::Connected { connection, .. } => {
                Some(connection)
            }
        }
    }

    pub fn is_connected(&self) -> bool {
        matches!(self.state, State::Connected { .. })
    }

    /// Claims the transport and reads its descriptor strings. Returns a
    /// description of the probe.
    pub fn open(&mut self, mut transport: T) -> Result<String, SessionError> {
        if !matches!(self.state, State::Closed) {
            return Err(SessionError::AlreadyOpen);
        }
        transport.claim()?;
        let descriptor = transport.descriptor();
        let connection = ProbeConnection {
            vendor_id: descriptor.vendor_id,
            product_id: descriptor.product_id,
            strings: transport.descriptor_strings(),
            packet_size: transport.packet_size(),
        };
        let description = connection.to_string();
        log::info!("opened {description}, {} byte reports", connection.packet_size);
        self.state = State::Open {
            transport,
            connection,
        };
        Ok(description)
    }

    /// Brings up the SWD link and identifies the target. On failure the
    /// transport is released and the session is closed.
    pub fn connect(&mut self) -> Result<String, SessionError> {
        let (mut transport, connection) = match std::mem::replace(&mut self.state, State::Closed) {
            State::Open {
                transport,
                connection,
            } => (transport, connection),
            state @ State::Connected { .. } => {
                self.state = state;
                return Err(SessionError::AlreadyOpen);
            }
            State::Closed => return Err(SessionError::NotOpen),
        };
        if connection.packet_size == 0 {
            transport.release();
            return Err(SessionError::ZeroPacketSize);
        }
        if !self.classifier.classify_descriptor(&transport.descriptor()) {
            transport.release();
            return Err(SessionError::NotAProbe {
                vendor_id: connection.vendor_id,
                product_id: connection.product_id,
            });
        }

        let mut dap = Dap::new(transport, self.config.swd_config());
        match identify(&mut dap) {
            Ok(report) => {
                self.state = State::Connected { dap, connection };
                Ok(report)
            }
            Err(e) => {
                log::warn!("connect failed: {e}");
                if let Err(e) = dap.disconnect() {
                    log::debug!("disconnect after failed connect: {e}");
                }
                dap.into_transport().release();
                Err(e.into())
            }
        }
    }

    /// LED off, DAP_Disconnect, release the transport. Safe to call in any state.
    pub fn disconnect(&mut self) {
        match std::mem::replace(&mut self.state, State::Closed) {
            State::Closed => {}
            State::Open { mut transport, .. } => transport.release(),
            State::Connected { mut dap, .. } => {
                if let Err(e) = dap.led_off() {
                    log::warn!("LED off: {e}");
                }
                if let Err(e) = dap.disconnect() {
                    log::warn!("DAP disconnect: {e}");
                }
                dap.into_transport().release();
                log::info!("disconnected");
            }
        }
    }

    fn dap(&mut self) -> Result<&mut Dap<T>, SessionError> {
        match &mut self.state {
            State::Connected { dap, .. } => Ok(dap),
            _ => Err(SessionError::NotConnected),
        }
    }

    /// Pulses nRESET and reconnects. Returns the DPIDR read after the reset.
    pub fn cpu_reset(&mut self) -> Result<u32, SessionError> {
        Ok(self.dap()?.reset_and_reconnect()?)
    }

    pub fn cpu_run(&mut self) -> Result<(), SessionError> {
        Ok(self.dap()?.resume_core()?)
    }

    pub fn cpu_halt(&mut self) -> Result<(), SessionError> {
        Ok(self.dap()?.halt_core()?)
    }

    pub fn cpu_status(&mut self) -> Result<CoreStatus, SessionError> {
        Ok(self.dap()?.core_status()?)
    }

    /// PC, LR and SP as fixed-width hex
    pub fn core_registers(&mut self) -> Result<String, SessionError> {
        let dap = self.dap()?;
        let pc = dap.read_core_register(CoreRegister::PC)?;
        let lr = dap.read_core_register(CoreRegister::LR)?;
        let sp = dap.read_core_register(CoreRegister::SP)?;
        Ok(format!("PC:{pc:08x} LR:{lr:08x} SP:{sp:08x}"))
    }

    pub fn read_core_register(&mut self, register: CoreRegister) -> Result<u32, SessionError> {
        Ok(self.dap()?.read_core_register(register)?)
    }

    pub fn write_core_register(
        &mut self,
        register: CoreRegister,
        value: u32,
    ) -> Result<(), SessionError> {
        Ok(self.dap()?.write_core_register(register, value)?)
    }

    pub fn read_addr(&mut self, address: u32) -> Result<u32, SessionError> {
        Ok(self.dap()?.read_memory_word(address)?)
    }

    pub fn write_addr(&mut self, address: u32, value: u32) -> Result<(), SessionError> {
        Ok(self.dap()?.write_memory_word(address, value)?)
    }

    pub fn read_block(&mut self, address: u32, words: usize) -> Result<Vec<u32>, SessionError> {
        Ok(self.dap()?.read_memory_block(address, words)?)
    }

    pub fn get_cpu_identity(&mut self) -> Result<CpuIdentity, SessionError> {
        Ok(self.dap()?.cpu_id()?)
    }

    /// Messages collected since connect, empty when not connected
    pub fn session_log(&self) -> &[String] {
        match &self.state {
            State::Connected { dap, .. } => dap.session().log.as_slice(),
            _ => &[],
        }
    }

    /// Access to the engine for operations not covered above
    pub fn engine(&mut self) -> Option<&mut Dap<T>> {
        self.dap().ok()
    }
}

/// Runs the connect sequence and the identifying reads, one line per result
fn identify<T: Transport>(dap: &mut Dap<T>) -> Result<String, DapError> {
    let mut report = Vec::new();

    let version = dap.firmware_version()?;
    let line = format!("Firmware version: {version}");
    dap.note(line.clone());
    report.push(line);
    dap.led_on()?;

    // Logged by the engine as part of the line bring-up
    let dpidr = dap.connect_line()?;
    report.push(format!("IdCode: {dpidr:#010x}"));

    let idr = dap.ap_identification()?;
    let line = format!("CoreId: {idr:#010x} ({})", ap::Idr::from(idr));
    dap.note(line.clone());
    report.push(line);

    let cpu = dap.cpu_id()?;
    if cpu.core().is_none() {
        log::warn!("unrecognised CPUID {:#010x}", cpu.raw);
    }
    let line = format!("CpuId: {cpu}");
    dap.note(line.clone());
    report.push(line);

    Ok(report.join("\n"))
}
