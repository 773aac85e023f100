//! Line-level SDP access for the relay.
//!
//! Only what media anchoring needs is interpreted: the origin session id,
//! connection addresses, the first media description of each kind and its
//! ports. Every other line is carried through untouched, and the original line
//! terminator is kept.

use std::fmt;
use std::net::IpAddr;

use crate::error::{MediaError, Result};

/// Media streams the relay anchors
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MediaKind {
    Audio,
    Video,
    /// T.38 (`m=image`)
    Fax,
}

impl MediaKind {
    pub const ALL: [MediaKind; 3] = [MediaKind::Audio, MediaKind::Video, MediaKind::Fax];

    fn media_token(self) -> &'static str {
        match self {
            MediaKind::Audio => "audio",
            MediaKind::Video => "video",
            MediaKind::Fax => "image",
        }
    }
}

impl fmt::Display for MediaKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MediaKind::Audio => write!(f, "audio"),
            MediaKind::Video => write!(f, "video"),
            MediaKind::Fax => write!(f, "fax"),
        }
    }
}

/// Address used by a held (blackholed) stream
pub fn is_blackhole(ip: &IpAddr) -> bool {
    ip.is_unspecified()
}

/// RFC 1918 / unique-local / loopback / link-local addresses
pub fn is_private(ip: &IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => v4.is_private() || v4.is_loopback() || v4.is_link_local(),
        IpAddr::V6(v6) => {
            v6.is_loopback() || (v6.segments()[0] & 0xfe00) == 0xfc00 || (v6.segments()[0] & 0xffc0) == 0xfe80
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Sdp {
    lines: Vec<String>,
    newline: &'static str,
}

impl Sdp {
    pub fn parse(text: &str) -> Result<Self> {
        let newline = if text.contains("\r\n") { "\r\n" } else { "\n" };
        let lines: Vec<String> = text
            .lines()
            .map(|l| l.trim_end_matches('\r').to_string())
            .filter(|l| !l.is_empty())
            .collect();
        if lines.is_empty() {
            return Err(MediaError::protocol("empty SDP body"));
        }
        Ok(Self { lines, newline })
    }

    pub fn lines(&self) -> &[String] {
        &self.lines
    }

    /// Session id of the `o=` line; requires all six origin fields
    pub fn origin_session_id(&self) -> Result<String> {
        let origin = self
            .lines
            .iter()
            .find_map(|l| l.strip_prefix("o="))
            .ok_or_else(|| MediaError::protocol("SDP has no o= line"))?;
        let tokens: Vec<&str> = origin.split_whitespace().collect();
        if tokens.len() != 6 || tokens[1].is_empty() || tokens[5].is_empty() {
            return Err(MediaError::protocol("Unable to parse session-id from SDP"));
        }
        Ok(tokens[1].to_string())
    }

    fn first_media_line(&self) -> usize {
        self.lines
            .iter()
            .position(|l| l.starts_with("m="))
            .unwrap_or(self.lines.len())
    }

    /// Line range `[m=, next m=)` of the first media description of `kind`
    fn media_range(&self, kind: MediaKind) -> Option<(usize, usize)> {
        let token = kind.media_token();
        let start = self.lines.iter().position(|l| {
            l.strip_prefix("m=")
                .and_then(|rest| rest.split_whitespace().next())
                .map(|t| t == token)
                .unwrap_or(false)
        })?;
        let end = self.lines[start + 1..]
            .iter()
            .position(|l| l.starts_with("m="))
            .map(|p| start + 1 + p)
            .unwrap_or(self.lines.len());
        Some((start, end))
    }

    pub fn has_media(&self, kind: MediaKind) -> bool {
        self.media_range(kind).is_some()
    }

    pub fn session_address(&self) -> Option<IpAddr> {
        self.lines[..self.first_media_line()]
            .iter()
            .find_map(|l| parse_connection(l))
    }

    /// Media-level `c=` address of `kind`, if the description has one
    pub fn media_level_address(&self, kind: MediaKind) -> Option<IpAddr> {
        let (start, end) = self.media_range(kind)?;
        self.lines[start + 1..end].iter().find_map(|l| parse_connection(l))
    }

    /// Effective address of a media stream: media level, else session level
    pub fn media_address(&self, kind: MediaKind) -> Option<IpAddr> {
        self.media_level_address(kind).or_else(|| self.session_address())
    }

    pub fn media_port(&self, kind: MediaKind) -> Option<u16> {
        let (start, _) = self.media_range(kind)?;
        self.lines[start]
            .split_whitespace()
            .nth(1)
            .and_then(|p| p.split('/').next())
            .and_then(|p| p.parse().ok())
    }

    /// `a=rtcp:` port when present, else data port + 1
    pub fn control_port(&self, kind: MediaKind) -> Option<u16> {
        let (start, end) = self.media_range(kind)?;
        let explicit = self.lines[start + 1..end].iter().find_map(|l| {
            l.strip_prefix("a=rtcp:")
                .and_then(|rest| rest.split_whitespace().next())
                .and_then(|p| p.parse::<u16>().ok())
        });
        explicit.or_else(|| self.media_port(kind).map(|p| p.saturating_add(1)))
    }

    pub fn set_session_address(&mut self, ip: IpAddr) {
        let end = self.first_media_line();
        if let Some(line) = self.lines[..end].iter_mut().find(|l| l.starts_with("c=")) {
            *line = connection_line(ip);
        }
    }

    /// Rewrite the media-level `c=`; inserted after the `m=` line if absent
    pub fn set_media_address(&mut self, kind: MediaKind, ip: IpAddr) {
        let Some((start, end)) = self.media_range(kind) else {
            return;
        };
        match self.lines[start + 1..end].iter().position(|l| l.starts_with("c=")) {
            Some(offset) => self.lines[start + 1 + offset] = connection_line(ip),
            None => {
                // c= goes after i= when there is one
                let at = if self.lines.get(start + 1).is_some_and(|l| l.starts_with("i=")) {
                    start + 2
                } else {
                    start + 1
                };
                self.lines.insert(at, connection_line(ip));
            }
        }
    }

    pub fn set_media_ports(&mut self, kind: MediaKind, data: u16, control: u16) {
        let Some((start, end)) = self.media_range(kind) else {
            return;
        };
        let mut tokens: Vec<String> = self.lines[start].split_whitespace().map(str::to_string).collect();
        if tokens.len() >= 2 {
            tokens[1] = match tokens[1].split_once('/') {
                Some((_, count)) => format!("{}/{}", data, count),
                None => data.to_string(),
            };
            self.lines[start] = tokens.join(" ");
        }
        for line in &mut self.lines[start + 1..end] {
            if let Some(rest) = line.strip_prefix("a=rtcp:") {
                let mut parts = rest.splitn(2, ' ');
                parts.next();
                *line = match parts.next() {
                    Some(tail) => format!("a=rtcp:{} {}", control, tail),
                    None => format!("a=rtcp:{}", control),
                };
            }
        }
    }

    /// Remove `a=<name>` / `a=<name>:...` lines from a media description
    pub fn remove_media_attribute(&mut self, kind: MediaKind, name: &str) {
        let Some((start, end)) = self.media_range(kind) else {
            return;
        };
        let bare = format!("a={}", name);
        let valued = format!("a={}:", name);
        let mut index = start;
        self.lines.retain(|line| {
            let keep = !(index > start && index < end && (*line == bare || line.starts_with(&valued)));
            index += 1;
            keep
        });
    }
}

impl fmt::Display for Sdp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for line in &self.lines {
            write!(f, "{}{}", line, self.newline)?;
        }
        Ok(())
    }
}

fn parse_connection(line: &str) -> Option<IpAddr> {
    let rest = line.strip_prefix("c=")?;
    let mut tokens = rest.split_whitespace();
    let _net = tokens.next()?;
    let _family = tokens.next()?;
    let address = tokens.next()?;
    address.split('/').next()?.parse().ok()
}

fn connection_line(ip: IpAddr) -> String {
    match ip {
        IpAddr::V4(v4) => format!("c=IN IP4 {}", v4),
        IpAddr::V6(v6) => format!("c=IN IP6 {}", v6),
    }
}
