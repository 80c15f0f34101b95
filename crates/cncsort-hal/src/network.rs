//! FluidNC controller over its HTTP command endpoint.
//!
//! Every command, including the `?` status query, is sent as
//! `GET /command?commandText=<line>`.  The reply to a motion line only means
//! it was queued; `send` then polls `?` until the move has settled.

use std::time::Duration;

use cncsort_kernel::{MachineController, ValidatedCommand};
use cncsort_types::{MachinePosition, SorterError};
use reqwest::Url;
use reqwest::blocking::Client;
use tracing::{debug, info, warn};

use crate::gcode::{self, GcodeError, STATUS_QUERY, Settle, StatusReport};

pub struct NetworkController {
    name: String,
    base_url: String,
    client: Client,
    connected: bool,
    settle: Settle,
}

impl NetworkController {
    pub fn new(host: &str, port: u16, timeout: Duration) -> Result<Self, SorterError> {
        let name = format!("http:{host}:{port}");
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| SorterError::collaborator(&name, e))?;
        Ok(Self {
            name,
            base_url: format!("http://{host}:{port}"),
            client,
            connected: false,
            settle: Settle::default(),
        })
    }

    pub fn with_settle(mut self, settle: Settle) -> Self {
        self.settle = settle;
        self
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// `<base>/command?commandText=<text>`, query-encoded.
    pub fn command_url(base_url: &str, text: &str) -> Result<Url, SorterError> {
        Url::parse_with_params(&format!("{base_url}/command"), &[("commandText", text)])
            .map_err(|e| SorterError::collaborator("http", e))
    }

    fn command(&self, text: &str) -> Result<String, SorterError> {
        if !self.connected {
            return Err(SorterError::collaborator(&self.name, "not connected"));
        }
        let url = Self::command_url(&self.base_url, text)?;
        let response = self
            .client
            .get(url)
            .send()
            .map_err(|e| SorterError::collaborator(&self.name, e))?;
        let status = response.status();
        let body = response
            .text()
            .map_err(|e| SorterError::collaborator(&self.name, e))?;
        if !status.is_success() {
            return Err(SorterError::collaborator(&self.name, format!("HTTP {status}: {body}")));
        }
        debug!(controller = %self.name, text, "command sent");
        Ok(body)
    }

    fn status(&self) -> Result<StatusReport, SorterError> {
        Ok(gcode::parse_status(&self.command(STATUS_QUERY)?)?)
    }
}

impl MachineController for NetworkController {
    fn name(&self) -> &str {
        &self.name
    }

    fn connect(&mut self) -> Result<(), SorterError> {
        let response = self
            .client
            .get(format!("{}/", self.base_url))
            .send()
            .map_err(|e| SorterError::collaborator(&self.name, e))?;
        if !response.status().is_success() {
            return Err(SorterError::collaborator(
                &self.name,
                format!("HTTP {}", response.status()),
            ));
        }
        self.connected = true;
        info!(controller = %self.name, "controller reachable");
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
        let body = self.command(&line)?;
        if let gcode::Reply::Error(code) = gcode::parse_reply(&body) {
            warn!(controller = %self.name, %line, %code, "command refused");
            return Err(GcodeError::Rejected(code).into());
        }
        gcode::wait_until_settled(&self.settle, command.command(), || self.status())?;
        Ok(())
    }

    fn disconnect(&mut self) {
        self.connected = false;
    }
}
