//! Pattern-based parser for tunnel client output
//!
//! Classifies stdout/stderr lines of an external tunnel client into tunnel
//! statuses using regex patterns.

use crate::vpn::tunnel::TunnelStatus;
use regex::Regex;

/// Parser for tunnel client output
pub struct OutputParser {
    /// "Configured as 10.0.0.2", "Connected tun0 as 10.0.0.2",
    /// "Initialization Sequence Completed"
    connected_pattern: Regex,
    /// Endpoint did not answer: refused, timed out, no route, DNS
    unreachable_pattern: Regex,
    /// "Failed to authenticate"
    auth_failed_pattern: Regex,
    /// Certificate validation errors
    cert_error_pattern: Regex,
    /// TUN device errors
    tun_error_pattern: Regex,
    /// TLS handshake errors
    handshake_error_pattern: Regex,
    /// Orderly session shutdown
    disconnect_pattern: Regex,
}

impl OutputParser {
    /// Create a new OutputParser with compiled regex patterns
    pub fn new() -> Self {
        Self {
            connected_pattern: Regex::new(
                r"(?:Connected\s+\w+\s+as|Configured as)\s+\S+|Initialization Sequence Completed",
            )
            .expect("Failed to compile connected pattern"),
            unreachable_pattern: Regex::new(
                r"(?i)connection refused|timed out|network is unreachable|no route to host|cannot resolve|unknown host|name or service not known|getaddrinfo failed",
            )
            .expect("Failed to compile unreachable pattern"),
            auth_failed_pattern: Regex::new(r"(?i)failed to authenticate|auth_failed")
                .expect("Failed to compile auth_failed pattern"),
            cert_error_pattern: Regex::new(r"(?i)certificate|verification failed")
                .expect("Failed to compile cert_error pattern"),
            tun_error_pattern: Regex::new(r"(?i)failed to open tun|tun.*error|no tun device")
                .expect("Failed to compile tun_error pattern"),
            handshake_error_pattern: Regex::new(r"(?i)tls handshake|ssl connection failure")
                .expect("Failed to compile handshake_error pattern"),
            disconnect_pattern: Regex::new(r"(?i)session terminated|disconnected by server")
                .expect("Failed to compile disconnect pattern"),
        }
    }

    /// Classify one output line; `None` for lines that carry no status
    pub fn parse_line(&self, line: &str) -> Option<TunnelStatus> {
        if self.connected_pattern.is_match(line) {
            return Some(TunnelStatus::Connected);
        }

        if self.auth_failed_pattern.is_match(line) {
            return Some(TunnelStatus::Failed("authentication failed".to_string()));
        }

        if self.cert_error_pattern.is_match(line) {
            return Some(TunnelStatus::Failed(
                "certificate validation failed".to_string(),
            ));
        }

        if self.tun_error_pattern.is_match(line) {
            return Some(TunnelStatus::Failed(
                "failed to open TUN device".to_string(),
            ));
        }

        if self.handshake_error_pattern.is_match(line) {
            return Some(TunnelStatus::Failed("TLS handshake failed".to_string()));
        }

        // Checked after the fatal patterns: "handshake timed out" is a fault
        if self.unreachable_pattern.is_match(line) {
            return Some(TunnelStatus::Unreachable);
        }

        if self.disconnect_pattern.is_match(line) {
            return Some(TunnelStatus::Disconnecting);
        }

        None
    }
}

impl Default for OutputParser {
    fn default() -> Self {
        Self::new()
    }
}
