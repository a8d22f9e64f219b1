//! Operator input parsing

/// One line typed at the console
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConsoleCommand {
    /// Forward the text to the controller
    Send(String),
    /// Open the configured port
    Open,
    /// Close the link
    Close,
    /// Print the connection state
    Status,
    /// Close and exit
    Quit,
    /// Blank line
    Empty,
    /// A `:` directive that does not exist
    Unknown(String),
}

impl ConsoleCommand {
    /// Parse a line of input. Lines starting with `:` are console
    /// directives, anything else goes to the controller verbatim.
    pub fn parse(line: &str) -> Self {
        let line = line.trim_end_matches(['\r', '\n']);
        if line.trim().is_empty() {
            return ConsoleCommand::Empty;
        }

        match line.strip_prefix(':').map(str::trim) {
            Some("q") | Some("quit") | Some("exit") => ConsoleCommand::Quit,
            Some("open") => ConsoleCommand::Open,
            Some("close") => ConsoleCommand::Close,
            Some("status") => ConsoleCommand::Status,
            Some(other) => ConsoleCommand::Unknown(other.to_string()),
            None => ConsoleCommand::Send(line.to_string()),
        }
    }
}
