//! GRBL / FluidNC controller over a serial line.
//!
//! The controller speaks the plain line protocol from [`crate::gcode`]: one
//! command per line, answered by `ok` or `error:N`.  Position comes from the
//! `?` status report.  A motion command returns once the status polls show
//! the machine `Idle` at the target, not at the `ok`.
//!
//! Any `Read + Write` byte stream can serve as the link, which lets tests
//! drive the controller with a scripted buffer.  Opening a real port needs
//! the `serial` feature.

use std::io::{BufRead, BufReader, Read, Write};
use std::time::Duration;

use cncsort_kernel::{MachineController, ValidatedCommand};
use cncsort_types::{MachinePosition, SorterError};
use tracing::{debug, info, warn};

use crate::gcode::{self, GcodeError, Reply, STATUS_QUERY, Settle, StatusReport};

/// Lines read while waiting for `ok` or a status report before giving up.
const MAX_REPLY_LINES: usize = 16;

/// Byte stream to the controller.
pub trait SerialLink: Read + Write + Send {}

impl<T: Read + Write + Send> SerialLink for T {}

pub struct SerialController {
    name: String,
    port: String,
    baud_rate: u32,
    timeout: Duration,
    link: Option<BufReader<Box<dyn SerialLink>>>,
    connected: bool,
    settle: Settle,
}

impl SerialController {
    /// Controller for `port`; the port is opened on [`MachineController::connect`].
    pub fn new(port: impl Into<String>, baud_rate: u32, timeout: Duration) -> Self {
        let port = port.into();
        Self {
            name: format!("serial:{port}"),
            port,
            baud_rate,
            timeout,
            link: None,
            connected: false,
            settle: Settle::default(),
        }
    }

    /// Controller over an already-open link.
    pub fn with_link(name: impl Into<String>, link: Box<dyn SerialLink>) -> Self {
        let name = name.into();
        Self {
            port: name.clone(),
            name,
            baud_rate: 0,
            timeout: Duration::from_secs(2),
            link: Some(BufReader::new(link)),
            connected: false,
            settle: Settle::default(),
        }
    }

    pub fn with_settle(mut self, settle: Settle) -> Self {
        self.settle = settle;
        self
    }

    pub fn port(&self) -> &str {
        &self.port
    }

    #[cfg(feature = "serial")]
    fn open_port(&self) -> Result<Box<dyn SerialLink>, SorterError> {
        let port = serialport::new(&self.port, self.baud_rate)
            .timeout(self.timeout)
            .open()
            .map_err(|e| SorterError::collaborator(&self.name, e))?;
        Ok(Box::new(port))
    }

    #[cfg(not(feature = "serial"))]
    fn open_port(&self) -> Result<Box<dyn SerialLink>, SorterError> {
        let _ = (self.baud_rate, self.timeout);
        Err(SorterError::collaborator(
            &self.name,
            "serial port support not compiled in (enable the `serial` feature)",
        ))
    }

    fn link(&mut self) -> Result<&mut BufReader<Box<dyn SerialLink>>, SorterError> {
        match (&mut self.link, self.connected) {
            (Some(link), true) => Ok(link),
            _ => Err(SorterError::collaborator(&self.name, "not connected")),
        }
    }

    fn write_line(&mut self, line: &str) -> Result<(), SorterError> {
        let name = self.name.clone();
        let link = self.link()?;
        let io = |e: std::io::Error| SorterError::collaborator(&name, e);
        link.get_mut().write_all(line.as_bytes()).map_err(io)?;
        link.get_mut().write_all(b"\n").map_err(io)?;
        link.get_mut().flush().map_err(io)?;
        debug!(controller = %name, line, "sent");
        Ok(())
    }

    fn read_line(&mut self) -> Result<String, SorterError> {
        let name = self.name.clone();
        let link = self.link()?;
        let mut buf = String::new();
        let n = link
            .read_line(&mut buf)
            .map_err(|e| SorterError::collaborator(&name, e))?;
        if n == 0 {
            return Err(SorterError::collaborator(&name, "link closed"));
        }
        Ok(buf)
    }

    fn status(&mut self) -> Result<StatusReport, SorterError> {
        self.write_line(STATUS_QUERY)?;
        for _ in 0..MAX_REPLY_LINES {
            let line = self.read_line()?;
            if let Reply::Status(status) = gcode::parse_reply(&line) {
                return Ok(gcode::parse_status(&status)?);
            }
        }
        Err(GcodeError::MissingPosition("no status report received".into()).into())
    }

    fn acknowledge(&mut self, line: &str) -> Result<(), SorterError> {
        for _ in 0..MAX_REPLY_LINES {
            match gcode::parse_reply(&self.read_line()?) {
                Reply::Ok => return Ok(()),
                Reply::Error(code) => {
                    warn!(controller = %self.name, %line, %code, "command refused");
                    return Err(GcodeError::Rejected(code).into());
                }
                Reply::Alarm(code) => return Err(GcodeError::Alarm(code).into()),
                Reply::Status(_) | Reply::Other(_) => continue,
            }
        }
        Err(SorterError::collaborator(&self.name, format!("no acknowledgement for '{line}'")))
    }
}

impl MachineController for SerialController {
    fn name(&self) -> &str {
        &self.name
    }

    fn connect(&mut self) -> Result<(), SorterError> {
        if self.connected {
            return Ok(());
        }
        if self.link.is_none() {
            let port = self.open_port()?;
            self.link = Some(BufReader::new(port));
        }
        self.connected = true;
        info!(controller = %self.name, baud = self.baud_rate, "serial link open");
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected
    }

    fn position(&mut self) -> Result<MachinePosition, SorterError> {
        Ok(self.status()?.position)
    }

    fn send(&mut self, command: &ValidatedCommand) -> Result<(), SorterError> {
        let line = gcode::format_command(command.command());
        self.write_line(&line)?;
        self.acknowledge(&line)?;
        let settle = self.settle;
        gcode::wait_until_settled(&settle, command.command(), || self.status())?;
        Ok(())
    }

    fn disconnect(&mut self) {
        if self.connected {
            info!(controller = %self.name, "serial link closed");
        }
        self.connected = false;
        self.link = None;
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::io::Cursor;
    use std::sync::{Arc, Mutex};

    /// Link that replays canned controller output and records what was written.
    pub(crate) struct ScriptedLink {
        input: Cursor<Vec<u8>>,
        pub(crate) written: Arc<Mutex<Vec<u8>>>,
    }

    impl ScriptedLink {
        pub(crate) fn new(replies: &str) -> Self {
            Self {
                input: Cursor::new(replies.as_bytes().to_vec()),
                written: Arc::new(Mutex::new(Vec::new())),
            }
        }
    }

    impl Read for ScriptedLink {
        fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
            self.input.read(buf)
        }
    }

    impl Write for ScriptedLink {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.written.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    /// Settle wait without sleeps, for scripted links.
    pub(crate) fn instant_settle() -> Settle {
        Settle {
            poll_interval: Duration::ZERO,
            ..Settle::default()
        }
    }

    fn controller(replies: &str) -> (SerialController, Arc<Mutex<Vec<u8>>>) {
        let link = ScriptedLink::new(replies);
        let written = link.written.clone();
        let mut c = SerialController::with_link("serial:test", Box::new(link)).with_settle(instant_settle());
        c.connect().unwrap();
        (c, written)
    }

    #[test]
    fn reads_position_from_status_report() {
        let (mut c, written) = controller("ok\r\n<Idle|MPos:12.000,34.500,5.000|FS:0,0>\r\n");
        let pos = c.position().unwrap();
        assert_eq!(pos, MachinePosition::new(12.0, 34.5, 5.0));
        assert_eq!(String::from_utf8(written.lock().unwrap().clone()).unwrap(), "?\n");
    }

    #[test]
    fn requires_connection() {
        let mut c = SerialController::with_link("serial:test", Box::new(ScriptedLink::new("")));
        assert!(c.position().is_err());
        c.connect().unwrap();
        c.disconnect();
        assert!(!c.is_connected());
        assert!(c.position().is_err());
    }

    #[test]
    fn closed_link_is_reported() {
        let (mut c, _) = controller("");
        let err = c.position().unwrap_err();
        assert!(err.to_string().contains("link closed"));
    }

    fn written(buf: &Arc<Mutex<Vec<u8>>>) -> String {
        String::from_utf8(buf.lock().unwrap().clone()).unwrap()
    }

    fn accepted(target: MachinePosition) -> ValidatedCommand {
        use cncsort_kernel::{MotionValidator, SafetyEnvelope, Verdict};
        use cncsort_types::{CommandOrigin, MotionCommand, WorkspaceLimits};

        let validator = MotionValidator::new(SafetyEnvelope::new(WorkspaceLimits::new(800.0, 400.0, 100.0)).unwrap());
        match validator.validate(MotionCommand::rapid(target, CommandOrigin::Operator), &MachinePosition::origin()) {
            Verdict::Accepted(cmd) => cmd,
            Verdict::Rejected(reason) => panic!("rejected: {reason}"),
        }
    }

    #[test]
    fn send_returns_only_after_machine_is_idle_at_target() {
        let (mut c, out) = controller(concat!(
            "ok\r\n",
            "<Run|MPos:20.000,10.000,50.000>\r\n",
            "<Run|MPos:80.000,40.000,50.000>\r\n",
            "<Idle|MPos:100.000,50.000,50.000>\r\n",
        ));
        c.send(&accepted(MachinePosition::new(100.0, 50.0, 50.0))).unwrap();
        assert_eq!(written(&out), "G0 X100.000 Y50.000 Z50.000\n?\n?\n?\n");
    }

    #[test]
    fn buffered_ok_without_arrival_is_not_success() {
        // The controller keeps reporting `Run`; the script then runs dry.
        let (mut c, _) = controller("ok\r\n<Run|MPos:20.000,10.000,50.000>\r\n");
        let err = c.send(&accepted(MachinePosition::new(100.0, 50.0, 50.0))).unwrap_err();
        assert!(err.to_string().contains("link closed"));
    }

    #[test]
    fn alarm_while_moving_fails_the_send() {
        let (mut c, _) = controller("ok\r\n<Alarm|MPos:20.000,10.000,50.000>\r\n");
        let err = c.send(&accepted(MachinePosition::new(100.0, 50.0, 50.0))).unwrap_err();
        assert!(err.to_string().contains("alarm"));
    }

    #[cfg(not(feature = "serial"))]
    #[test]
    fn real_port_needs_feature() {
        let mut c = SerialController::new("/dev/ttyUSB0", 115_200, Duration::from_secs(2));
        assert!(c.connect().is_err());
        assert!(!c.is_connected());
    }
}
