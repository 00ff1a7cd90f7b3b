//! What happens between a successful backend connect and the start of relay.

use crate::listener::Registration;

/// Line sent to a passthrough client once its backend is connected.
pub const AUTHENTICATE: &str = "AUTHENTICATE";

/// Pre-relay step for one session.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum PreRelay {
    /// Tell the client the backend is ready (passthrough mode).
    AnnounceToClient(&'static str),
    /// Register with the backend on the client's behalf (protocol-aware mode).
    WriteToBackend(Vec<String>),
}

impl PreRelay {
    /// Choose the step for a session. `registration` is present only in
    /// protocol-aware mode.
    pub fn for_session(registration: Option<&Registration>, capabilities: &[String]) -> Self {
        match registration {
            None => Self::AnnounceToClient(AUTHENTICATE),
            Some(reg) => Self::WriteToBackend(registration_lines(reg, capabilities)),
        }
    }
}

/// IRC registration burst: capability requests, optional server password,
/// then NICK and USER.
pub fn registration_lines(reg: &Registration, capabilities: &[String]) -> Vec<String> {
    let mut lines = Vec::with_capacity(capabilities.len() + 4);
    lines.extend(capabilities.iter().map(|cap| format!("CAP REQ {cap}")));
    lines.push("CAP END".to_string());
    if let Some(pass) = reg.pass.as_deref() {
        lines.push(format!("PASS {pass}"));
    }
    lines.push(format!("NICK {}", reg.nick));
    lines.push(format!("USER {0} * * :{0}", reg.nick));
    lines
}
