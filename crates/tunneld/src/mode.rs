//! Runtime mode dispatch.

/// The runtime modes this program can operate in.
///
/// Only the proxy mode exists today; dispatch stays a plain enum until a
/// second mode shows up.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Mode {
    /// TCP tunneling reverse proxy.
    Proxy,
}

impl Mode {
    /// Look up a mode by its configured name.
    pub fn create(name: &str) -> Option<Self> {
        match name {
            "proxy" => Some(Mode::Proxy),
            _ => None,
        }
    }

    /// The mode's canonical name.
    pub fn name(self) -> &'static str {
        match self {
            Mode::Proxy => "proxy",
        }
    }
}
