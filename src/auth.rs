/// SASL authentication for the connection handshake. The mechanism name is
/// matched against the server's space-separated offer in connection.start.
/// Implementations are shared with the recovery machinery, which re-runs
/// the handshake on every reconnect attempt.
pub trait Sasl: Default + Clone + Send + Sync + 'static {
    fn mechanism(&self) -> String;
    fn response(&self) -> String;
}

/// Built-in SASL mechanisms.
#[derive(Debug, Clone, PartialEq)]
pub enum Auth {
    Plain { username: String, password: String },
    External,
}

impl Default for Auth {
    fn default() -> Auth {
        Auth::Plain {
            username: "guest".to_string(),
            password: "guest".to_string(),
        }
    }
}

impl Sasl for Auth {
    fn mechanism(&self) -> String {
        match *self {
            Auth::Plain { .. } => "PLAIN".to_string(),
            Auth::External => "EXTERNAL".to_string(),
        }
    }

    fn response(&self) -> String {
        match self {
            Auth::Plain { username, password } => format!("\x00{}\x00{}", username, password),
            Auth::External => "".to_string(),
        }
    }
}
