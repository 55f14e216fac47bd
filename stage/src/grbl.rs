//! Request/response exchange with grbl: one line out, one reply back.

use std::fmt;
use std::path::PathBuf;
use std::thread;

use log::{debug, trace};

use crate::config::IdlePolicy;
use crate::motor::SerialLink;

#[derive(Debug, thiserror::Error)]
pub enum StageError {
    #[error("no grbl found on any of the ports {ports:?}")]
    NoController { ports: Vec<PathBuf> },
    #[error("empty response or timeout for {command:?}")]
    EmptyResponse { command: String },
    #[error("non ok response to {command:?}: {response:?}")]
    Protocol { command: String, response: String },
    #[error("malformed status report: {raw:?}")]
    MalformedStatus { raw: String },
    #[error("controller not idle after {polls} status polls")]
    IdleTimeout { polls: u64 },
    #[error("homing failed, controller reports {state}")]
    Homing { state: MachineState },
    #[error("serial transport error: {0}")]
    Transport(#[source] std::io::Error),
}

impl StageError {
    /// Faults the idle poll shrugs off and retries on the next tick.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            StageError::EmptyResponse { .. }
                | StageError::Protocol { .. }
                | StageError::MalformedStatus { .. }
        )
    }
}

/// State word of a grbl status report.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MachineState {
    Idle,
    Run,
    Hold,
    Jog,
    Alarm,
    Door,
    Check,
    Home,
    Sleep,
    Unknown(String),
}

impl MachineState {
    /// Case-insensitive; sub-states such as `Hold:0` collapse to their parent.
    pub fn from_word(word: &str) -> Self {
        let base = word.split(':').next().unwrap_or_default();
        match base.to_ascii_uppercase().as_str() {
            "IDLE" => MachineState::Idle,
            "RUN" => MachineState::Run,
            "HOLD" => MachineState::Hold,
            "JOG" => MachineState::Jog,
            "ALARM" => MachineState::Alarm,
            "DOOR" => MachineState::Door,
            "CHECK" => MachineState::Check,
            "HOME" => MachineState::Home,
            "SLEEP" => MachineState::Sleep,
            _ => MachineState::Unknown(word.to_string()),
        }
    }
}

impl fmt::Display for MachineState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MachineState::Unknown(word) => write!(f, "{word:?}"),
            other => write!(f, "{}", format!("{other:?}").to_ascii_uppercase()),
        }
    }
}

/// Checks a command reply: an echoed command is dropped, then the reply must
/// start with `ok`. Returns whatever follows the `ok` line, if anything.
pub fn parse_reply(command: &str, raw: &str, ignore_empty: bool) -> Result<Option<String>, StageError> {
    if raw.is_empty() {
        if ignore_empty {
            return Ok(None);
        }
        return Err(StageError::EmptyResponse {
            command: command.to_string(),
        });
    }

    let reply = raw.strip_prefix(command).unwrap_or(raw).trim_start();
    match reply.strip_prefix("ok") {
        Some(rest) => {
            let rest = rest.trim();
            Ok((!rest.is_empty()).then(|| rest.to_string()))
        }
        None => Err(StageError::Protocol {
            command: command.to_string(),
            response: raw.to_string(),
        }),
    }
}

/// Extracts the state word from `<Idle|MPos:17.530,0.000,0.000|FS:0,0>`.
pub fn parse_status(raw: &str) -> Result<MachineState, StageError> {
    let malformed = || StageError::MalformedStatus {
        raw: raw.to_string(),
    };
    let start = raw.find('<').ok_or_else(malformed)?;
    let end = raw[start..].find('>').ok_or_else(malformed)? + start;
    let body = &raw[start + 1..end];
    let word = body.split('|').next().unwrap_or_default();
    Ok(MachineState::from_word(word))
}

/// A grbl controller behind some serial link.
pub struct Grbl<L: SerialLink> {
    link: L,
}

impl<L: SerialLink> Grbl<L> {
    pub fn new(link: L) -> Self {
        Self { link }
    }

    pub fn link(&self) -> &L {
        &self.link
    }

    /// Drops whatever the controller printed on its own, e.g. the startup banner.
    pub fn discard_input(&mut self) -> Result<(), StageError> {
        let banner = self.link.read_reply()?;
        if !banner.is_empty() {
            debug!("discarded: {:?}", banner.trim());
        }
        Ok(())
    }

    pub fn send_command(&mut self, command: &str) -> Result<Option<String>, StageError> {
        self.exchange(command, false)
    }

    /// Like [`Grbl::send_command`] but a silent controller is not an error;
    /// homing may outlast the read timeout.
    pub fn send_command_allow_silence(&mut self, command: &str) -> Result<Option<String>, StageError> {
        self.exchange(command, true)
    }

    fn exchange(&mut self, command: &str, ignore_empty: bool) -> Result<Option<String>, StageError> {
        debug!("serial send: {command}");
        self.link.write_line(command)?;
        let raw = self.link.read_reply()?;
        debug!("serial receive: {:?}", raw);
        parse_reply(command, &raw, ignore_empty)
    }

    pub fn status(&mut self) -> Result<MachineState, StageError> {
        self.link.write_line("?")?;
        let raw = self.link.read_reply()?;
        trace!("status: {:?}", raw);
        if raw.is_empty() {
            return Err(StageError::EmptyResponse {
                command: "?".to_string(),
            });
        }
        parse_status(&raw)
    }

    /// Polls the status until the controller reports idle.
    ///
    /// Transient faults (empty, malformed or non-ok reads) are logged and
    /// retried. With `max_polls` unset the loop only ends on idle or on a
    /// transport error.
    pub fn wait_for_idle(&mut self, policy: &IdlePolicy) -> Result<(), StageError> {
        let mut polls = 0u64;
        loop {
            if let Some(max) = policy.max_polls {
                if polls >= max {
                    return Err(StageError::IdleTimeout { polls });
                }
            }
            polls += 1;

            match self.status() {
                Ok(MachineState::Idle) => return Ok(()),
                Ok(state) => trace!("waiting for idle, state {state}"),
                Err(e) if e.is_transient() => debug!("wait-for-idle poll failed: {e}"),
                Err(e) => return Err(e),
            }

            if !policy.poll_interval.is_zero() {
                thread::sleep(policy.poll_interval);
            }
        }
    }

    pub fn name(&self) -> String {
        self.link.name()
    }

    pub fn close(&mut self) {
        self.link.close();
    }
}
