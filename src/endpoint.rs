use regex_lite::Regex;

/// Unmatched tail text kept across feeds. Anything confirmed (full lines)
/// beyond this window is discarded to bound memory on chatty relays.
const SCAN_WINDOW: usize = 2048;

/// The publicly reachable address discovered from the relay's output.
/// Immutable once constructed; first match wins for the life of the run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublicEndpoint {
    host: String,
}

impl PublicEndpoint {
    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn url(&self) -> String {
        format!("https://{}", self.host)
    }
}

/// Incremental scanner for the relay CLI's endpoint marker.
///
/// The marker format (`url=https://<host>` in ngrok's `--log=stdout` text) is
/// an undocumented collaborator contract, so this is a best-effort substring
/// scan over cumulative text, tolerant of chunks that split the marker
/// anywhere. The first match latches: later feeds return `None`.
pub struct UrlExtractor {
    pattern: Regex,
    buffer: String,
    matched: bool,
}

impl Default for UrlExtractor {
    fn default() -> Self {
        Self::new()
    }
}

impl UrlExtractor {
    pub fn new() -> Self {
        Self {
            // Host token runs to the next whitespace, same as the relay's
            // own key=value log framing.
            pattern: Regex::new(r"url=https://(\S+)").unwrap(),
            buffer: String::new(),
            matched: false,
        }
    }

    /// Feed one chunk of relay output. Returns the endpoint on the feed that
    /// completes the first marker, and `None` forever after.
    pub fn feed(&mut self, chunk: &str) -> Option<PublicEndpoint> {
        if self.matched {
            return None;
        }

        self.buffer.push_str(chunk);

        if let Some(captures) = self.pattern.captures(&self.buffer) {
            let host = captures.get(1).map(|m| m.as_str().to_string())?;
            self.matched = true;
            self.buffer.clear();
            return Some(PublicEndpoint { host });
        }

        self.trim_window();
        None
    }

    pub fn is_matched(&self) -> bool {
        self.matched
    }

    /// Drop confirmed-unmatched text preceding the window. Only text up to
    /// the last newline is confirmed; an unterminated tail could still be the
    /// front half of a marker and must be kept whole.
    fn trim_window(&mut self) {
        if self.buffer.len() <= SCAN_WINDOW {
            return;
        }
        // The window edge is a byte offset; walk back to a char boundary so
        // multi-byte output (or replacement characters from lossy decoding)
        // cannot land the slice inside a character.
        let mut cut = self.buffer.len() - SCAN_WINDOW;
        while !self.buffer.is_char_boundary(cut) {
            cut -= 1;
        }
        if let Some(newline) = self.buffer[..cut].rfind('\n') {
            self.buffer.drain(..=newline);
        }
    }
}
