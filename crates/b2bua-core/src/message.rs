//! SIP message model
//!
//! A shallow representation good enough for a back-to-back agent: the start
//! line, an ordered header list and the body. Header values stay textual and
//! are interpreted on demand (tags, CSeq, Via branch, URIs). Compact header
//! forms are accepted on lookup and `Content-Length` is recomputed whenever a
//! message is serialized.

use std::fmt;
use std::net::IpAddr;

use uuid::Uuid;

use crate::error::{B2bError, Result};
use crate::transport::Transport;

const SIP_VERSION: &str = "SIP/2.0";

/// Max-Forwards assumed when a request carries none
pub const DEFAULT_MAX_FORWARDS: u32 = 70;

const COMPACT_FORMS: &[(&str, &str)] = &[
    ("i", "call-id"),
    ("f", "from"),
    ("t", "to"),
    ("v", "via"),
    ("m", "contact"),
    ("l", "content-length"),
    ("c", "content-type"),
    ("k", "supported"),
    ("s", "subject"),
    ("e", "content-encoding"),
    ("o", "event"),
    ("r", "refer-to"),
    ("b", "referred-by"),
    ("x", "session-expires"),
];

fn canonical(name: &str) -> String {
    let lower = name.trim().to_ascii_lowercase();
    COMPACT_FORMS
        .iter()
        .find(|(short, _)| *short == lower)
        .map(|(_, long)| (*long).to_string())
        .unwrap_or(lower)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StartLine {
    Request { method: String, uri: String },
    Response { status: u16, reason: String },
}

impl fmt::Display for StartLine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StartLine::Request { method, uri } => write!(f, "{} {} {}", method, uri, SIP_VERSION),
            StartLine::Response { status, reason } => write!(f, "{} {} {}", SIP_VERSION, status, reason),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Header {
    pub name: String,
    pub value: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SipMessage {
    start_line: StartLine,
    headers: Vec<Header>,
    body: String,
}

impl SipMessage {
    pub fn new_request(method: impl Into<String>, uri: impl Into<String>) -> Self {
        Self {
            start_line: StartLine::Request {
                method: method.into(),
                uri: uri.into(),
            },
            headers: Vec::new(),
            body: String::new(),
        }
    }

    pub fn new_response(status: u16, reason: impl Into<String>) -> Self {
        Self {
            start_line: StartLine::Response {
                status,
                reason: reason.into(),
            },
            headers: Vec::new(),
            body: String::new(),
        }
    }

    /// Parse a message from its wire text
    pub fn parse(text: &str) -> Result<Self> {
        let (head, body) = match text.find("\r\n\r\n") {
            Some(pos) => (&text[..pos], &text[pos + 4..]),
            None => match text.find("\n\n") {
                Some(pos) => (&text[..pos], &text[pos + 2..]),
                None => (text, ""),
            },
        };

        let mut lines = head.lines();
        let first = lines
            .next()
            .filter(|line| !line.trim().is_empty())
            .ok_or_else(|| B2bError::protocol("empty message"))?;
        let start_line = parse_start_line(first)?;

        let mut headers: Vec<Header> = Vec::new();
        for line in lines {
            if line.is_empty() {
                continue;
            }
            if line.starts_with(' ') || line.starts_with('\t') {
                let last = headers
                    .last_mut()
                    .ok_or_else(|| B2bError::protocol("continuation line without header"))?;
                last.value.push(' ');
                last.value.push_str(line.trim());
                continue;
            }
            let (name, value) = line
                .split_once(':')
                .ok_or_else(|| B2bError::protocol(format!("malformed header line: {line}")))?;
            headers.push(Header {
                name: name.trim().to_string(),
                value: value.trim().to_string(),
            });
        }

        let mut message = Self {
            start_line,
            headers,
            body: body.to_string(),
        };
        if let Some(len) = message.header("content-length").and_then(|v| v.parse::<usize>().ok()) {
            if len <= message.body.len() && message.body.is_char_boundary(len) {
                message.body.truncate(len);
            }
        }
        Ok(message)
    }

    pub fn start_line(&self) -> &StartLine {
        &self.start_line
    }

    pub fn is_request(&self) -> bool {
        matches!(self.start_line, StartLine::Request { .. })
    }

    pub fn is_response(&self) -> bool {
        !self.is_request()
    }

    /// Request method, `None` for responses
    pub fn method(&self) -> Option<&str> {
        match &self.start_line {
            StartLine::Request { method, .. } => Some(method),
            StartLine::Response { .. } => None,
        }
    }

    pub fn is_method(&self, method: &str) -> bool {
        self.method().is_some_and(|m| m.eq_ignore_ascii_case(method))
    }

    pub fn request_uri(&self) -> Option<&str> {
        match &self.start_line {
            StartLine::Request { uri, .. } => Some(uri),
            StartLine::Response { .. } => None,
        }
    }

    pub fn set_request_line(&mut self, method: impl Into<String>, uri: impl Into<String>) {
        self.start_line = StartLine::Request {
            method: method.into(),
            uri: uri.into(),
        };
    }

    pub fn status(&self) -> Option<u16> {
        match &self.start_line {
            StartLine::Response { status, .. } => Some(*status),
            StartLine::Request { .. } => None,
        }
    }

    pub fn reason(&self) -> Option<&str> {
        match &self.start_line {
            StartLine::Response { reason, .. } => Some(reason),
            StartLine::Request { .. } => None,
        }
    }

    pub fn is_trying(&self) -> bool {
        self.status() == Some(100)
    }

    pub fn is_1xx(&self) -> bool {
        self.status().is_some_and(|s| (100..200).contains(&s))
    }

    pub fn is_2xx(&self) -> bool {
        self.status().is_some_and(|s| (200..300).contains(&s))
    }

    pub fn is_3xx(&self) -> bool {
        self.status().is_some_and(|s| (300..400).contains(&s))
    }

    pub fn is_5xx(&self) -> bool {
        self.status().is_some_and(|s| (500..600).contains(&s))
    }

    pub fn is_error_response(&self) -> bool {
        self.status().is_some_and(|s| s >= 300)
    }

    /// True once the To header carries a tag
    pub fn is_mid_dialog(&self) -> bool {
        self.to_tag().is_some()
    }

    /// First value of a header, compact forms included
    pub fn header(&self, name: &str) -> Option<&str> {
        let name = canonical(name);
        self.headers
            .iter()
            .find(|h| canonical(&h.name) == name)
            .map(|h| h.value.as_str())
    }

    /// Every line of a header in message order
    pub fn header_values(&self, name: &str) -> Vec<&str> {
        let name = canonical(name);
        self.headers
            .iter()
            .filter(|h| canonical(&h.name) == name)
            .map(|h| h.value.as_str())
            .collect()
    }

    /// Every comma separated entry of a list header
    pub fn header_list(&self, name: &str) -> Vec<String> {
        self.header_values(name)
            .into_iter()
            .flat_map(split_list)
            .collect()
    }

    pub fn has_header(&self, name: &str) -> bool {
        self.header(name).is_some()
    }

    pub fn headers(&self) -> &[Header] {
        &self.headers
    }

    /// Replace every occurrence of `name` with a single value
    pub fn set_header(&mut self, name: &str, value: impl Into<String>) {
        let canon = canonical(name);
        let position = self.headers.iter().position(|h| canonical(&h.name) == canon);
        self.headers.retain(|h| canonical(&h.name) != canon);
        let header = Header {
            name: name.to_string(),
            value: value.into(),
        };
        match position {
            Some(index) if index <= self.headers.len() => self.headers.insert(index, header),
            _ => self.headers.push(header),
        }
    }

    pub fn add_header(&mut self, name: &str, value: impl Into<String>) {
        self.headers.push(Header {
            name: name.to_string(),
            value: value.into(),
        });
    }

    /// Insert `value` above any existing occurrence of `name`
    pub fn prepend_header(&mut self, name: &str, value: impl Into<String>) {
        let canon = canonical(name);
        let index = self
            .headers
            .iter()
            .position(|h| canonical(&h.name) == canon)
            .unwrap_or(0);
        self.headers.insert(
            index,
            Header {
                name: name.to_string(),
                value: value.into(),
            },
        );
    }

    pub fn remove_header(&mut self, name: &str) {
        let canon = canonical(name);
        self.headers.retain(|h| canonical(&h.name) != canon);
    }

    pub fn body(&self) -> &str {
        &self.body
    }

    pub fn set_body(&mut self, body: impl Into<String>) {
        self.body = body.into();
    }

    /// Content type without parameters, lower case
    pub fn content_type(&self) -> Option<String> {
        self.header("content-type")
            .map(|v| v.split(';').next().unwrap_or("").trim().to_ascii_lowercase())
    }

    pub fn has_sdp(&self) -> bool {
        !self.body.is_empty() && self.content_type().as_deref() == Some("application/sdp")
    }

    pub fn call_id(&self) -> Option<&str> {
        self.header("call-id")
    }

    pub fn from_tag(&self) -> Option<String> {
        self.header("from").and_then(tag_of)
    }

    pub fn to_tag(&self) -> Option<String> {
        self.header("to").and_then(tag_of)
    }

    /// CSeq number and method
    pub fn cseq(&self) -> Option<(u32, String)> {
        let value = self.header("cseq")?;
        let mut parts = value.split_whitespace();
        let number = parts.next()?.parse().ok()?;
        let method = parts.next()?.to_string();
        Some((number, method))
    }

    pub fn top_via(&self) -> Option<String> {
        self.header_list("via").into_iter().next()
    }

    pub fn top_via_branch(&self) -> Option<String> {
        self.top_via().and_then(|via| param_of(&via, "branch"))
    }

    /// Host of the top Via sent-by, when it is a literal address
    pub fn top_via_sent_by(&self) -> Option<IpAddr> {
        let via = self.top_via()?;
        let sent_by = via.split(';').next()?.split_whitespace().nth(1)?;
        let host = match sent_by.strip_prefix('[') {
            Some(rest) => rest.split(']').next()?,
            None => sent_by.split(':').next()?,
        };
        host.parse().ok()
    }

    /// Rewrite the branch parameter of the top Via
    pub fn set_top_via_branch(&mut self, branch: &str) -> Result<()> {
        let canon = canonical("via");
        let header = self
            .headers
            .iter_mut()
            .find(|h| canonical(&h.name) == canon)
            .ok_or_else(|| B2bError::protocol("message has no Via"))?;
        let mut entries = split_list(&header.value);
        let top = entries
            .first_mut()
            .ok_or_else(|| B2bError::protocol("empty Via header"))?;
        *top = replace_param(top, "branch", branch);
        header.value = entries.join(", ");
        Ok(())
    }

    pub fn max_forwards(&self) -> Option<u32> {
        self.header("max-forwards").and_then(|v| v.trim().parse().ok())
    }

    /// Build a response carrying the dialog identifying headers of this request
    pub fn create_response(&self, status: u16, reason: &str) -> SipMessage {
        let mut response = SipMessage::new_response(status, reason);
        for header in &self.headers {
            if matches!(canonical(&header.name).as_str(), "via" | "from" | "to" | "call-id" | "cseq") {
                response.headers.push(header.clone());
            }
        }
        if status > 100 && response.to_tag().is_none() {
            if let Some(to) = response.header("to").map(str::to_string) {
                let tag = Uuid::new_v4().simple().to_string();
                response.set_header("To", format!("{};tag={}", to, &tag[..8]));
            }
        }
        response
    }
}

impl fmt::Display for SipMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}\r\n", self.start_line)?;
        for header in &self.headers {
            if canonical(&header.name) == "content-length" {
                continue;
            }
            write!(f, "{}: {}\r\n", header.name, header.value)?;
        }
        write!(f, "Content-Length: {}\r\n\r\n{}", self.body.len(), self.body)
    }
}

fn parse_start_line(line: &str) -> Result<StartLine> {
    let line = line.trim();
    if let Some(rest) = line.strip_prefix(SIP_VERSION) {
        let rest = rest.trim_start();
        let (status, reason) = rest.split_once(' ').unwrap_or((rest, ""));
        let status = status
            .parse::<u16>()
            .map_err(|_| B2bError::protocol(format!("bad status line: {line}")))?;
        return Ok(StartLine::Response {
            status,
            reason: reason.trim().to_string(),
        });
    }
    let mut parts = line.split_whitespace();
    match (parts.next(), parts.next(), parts.next()) {
        (Some(method), Some(uri), Some(SIP_VERSION)) => Ok(StartLine::Request {
            method: method.to_string(),
            uri: uri.to_string(),
        }),
        _ => Err(B2bError::protocol(format!("bad request line: {line}"))),
    }
}

/// Split a header value on commas that are outside angle brackets and quotes
pub fn split_list(value: &str) -> Vec<String> {
    let mut entries = Vec::new();
    let mut current = String::new();
    let mut in_angle = false;
    let mut in_quote = false;
    for c in value.chars() {
        match c {
            '"' => in_quote = !in_quote,
            '<' if !in_quote => in_angle = true,
            '>' if !in_quote => in_angle = false,
            ',' if !in_angle && !in_quote => {
                let entry = current.trim();
                if !entry.is_empty() {
                    entries.push(entry.to_string());
                }
                current.clear();
                continue;
            }
            _ => {}
        }
        current.push(c);
    }
    let entry = current.trim();
    if !entry.is_empty() {
        entries.push(entry.to_string());
    }
    entries
}

/// Header parameters, i.e. those after the URI
fn header_params(value: &str) -> &str {
    match value.rfind('>') {
        Some(pos) => &value[pos + 1..],
        None => value.find(';').map(|pos| &value[pos..]).unwrap_or(""),
    }
}

/// Value of a header parameter such as `tag` or `branch`
pub fn param_of(value: &str, name: &str) -> Option<String> {
    header_params(value).split(';').find_map(|param| {
        let (key, val) = param.split_once('=')?;
        key.trim()
            .eq_ignore_ascii_case(name)
            .then(|| val.trim().to_string())
    })
}

/// Tag parameter of a From/To value
pub fn tag_of(value: &str) -> Option<String> {
    param_of(value, "tag").filter(|tag| !tag.is_empty())
}

/// The URI inside a name-addr, or the bare addr-spec
pub fn uri_of(value: &str) -> &str {
    if let (Some(start), Some(end)) = (value.find('<'), value.rfind('>')) {
        if start < end {
            return value[start + 1..end].trim();
        }
    }
    value.split(';').next().unwrap_or(value).trim()
}

fn replace_param(value: &str, name: &str, new_value: &str) -> String {
    let mut replaced = false;
    let parts: Vec<String> = value
        .split(';')
        .enumerate()
        .map(|(index, part)| {
            if index > 0 {
                if let Some((key, _)) = part.split_once('=') {
                    if key.trim().eq_ignore_ascii_case(name) {
                        replaced = true;
                        return format!("{}={}", key.trim(), new_value);
                    }
                }
            }
            part.to_string()
        })
        .collect();
    let mut joined = parts.join(";");
    if !replaced {
        joined.push_str(&format!(";{}={}", name, new_value));
    }
    joined
}

/// A `sip:`/`sips:` URI
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SipUri {
    pub scheme: String,
    pub user: Option<String>,
    pub host: String,
    pub port: Option<u16>,
    pub params: Vec<(String, Option<String>)>,
}

impl SipUri {
    pub fn parse(text: &str) -> Result<Self> {
        let text = uri_of(text.trim());
        let (scheme, rest) = text
            .split_once(':')
            .ok_or_else(|| B2bError::protocol(format!("URI without scheme: {text}")))?;
        let rest = rest.split('?').next().unwrap_or(rest);

        let mut sections = rest.split(';');
        let user_host = sections.next().unwrap_or("");
        let params = sections
            .filter(|p| !p.is_empty())
            .map(|p| match p.split_once('=') {
                Some((k, v)) => (k.to_string(), Some(v.to_string())),
                None => (p.to_string(), None),
            })
            .collect();

        let (user, host_port) = match user_host.rsplit_once('@') {
            Some((user, host_port)) => (Some(user.to_string()), host_port),
            None => (None, user_host),
        };

        let (host, port) = if let Some(rest) = host_port.strip_prefix('[') {
            let (host, after) = rest
                .split_once(']')
                .ok_or_else(|| B2bError::protocol(format!("bad IPv6 reference: {text}")))?;
            let port = after.strip_prefix(':').and_then(|p| p.parse().ok());
            (host.to_string(), port)
        } else {
            match host_port.rsplit_once(':') {
                Some((host, port)) => {
                    let port = port
                        .parse::<u16>()
                        .map_err(|_| B2bError::protocol(format!("bad port in URI: {text}")))?;
                    (host.to_string(), Some(port))
                }
                None => (host_port.to_string(), None),
            }
        };

        if host.is_empty() {
            return Err(B2bError::protocol(format!("URI without host: {text}")));
        }

        Ok(Self {
            scheme: scheme.to_ascii_lowercase(),
            user,
            host,
            port,
            params,
        })
    }

    pub fn param(&self, name: &str) -> Option<&str> {
        self.params
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .and_then(|(_, v)| v.as_deref())
    }

    pub fn has_param(&self, name: &str) -> bool {
        self.params.iter().any(|(k, _)| k.eq_ignore_ascii_case(name))
    }

    pub fn transport(&self) -> Option<Transport> {
        self.param("transport").and_then(|t| t.parse().ok())
    }

    pub fn is_secure(&self) -> bool {
        self.scheme == "sips"
    }

    /// Host as a literal address, if it is one
    pub fn ip(&self) -> Option<IpAddr> {
        self.host.parse().ok()
    }
}

impl fmt::Display for SipUri {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:", self.scheme)?;
        if let Some(user) = &self.user {
            write!(f, "{}@", user)?;
        }
        if self.host.contains(':') {
            write!(f, "[{}]", self.host)?;
        } else {
            write!(f, "{}", self.host)?;
        }
        if let Some(port) = self.port {
            write!(f, ":{}", port)?;
        }
        for (key, value) in &self.params {
            match value {
                Some(value) => write!(f, ";{}={}", key, value)?,
                None => write!(f, ";{}", key)?,
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    const INVITE: &str = "INVITE sip:bob@example.com SIP/2.0\r\n\
Via: SIP/2.0/UDP 10.0.0.1:5060;branch=z9hG4bK776asdhds;rport\r\n\
Max-Forwards: 70\r\n\
f: Alice <sip:alice@example.org>;tag=1928301774\r\n\
To: Bob <sip:bob@example.com>\r\n\
i: a84b4c76e66710@pc33.example.org\r\n\
CSeq: 314159 INVITE\r\n\
Contact: <sip:alice@10.0.0.1>\r\n\
Content-Type: application/sdp\r\n\
Content-Length: 4\r\n\
\r\n\
v=0\r\n";

    #[test]
    fn test_parse_request() {
        let msg = SipMessage::parse(INVITE).unwrap();
        assert!(msg.is_request());
        assert!(msg.is_method("invite"));
        assert_eq!(msg.request_uri(), Some("sip:bob@example.com"));
        assert_eq!(msg.call_id(), Some("a84b4c76e66710@pc33.example.org"));
        assert_eq!(msg.from_tag().as_deref(), Some("1928301774"));
        assert_eq!(msg.to_tag(), None);
        assert!(!msg.is_mid_dialog());
        assert_eq!(msg.cseq(), Some((314159, "INVITE".to_string())));
        assert_eq!(msg.top_via_branch().as_deref(), Some("z9hG4bK776asdhds"));
        assert_eq!(msg.top_via_sent_by(), Some("10.0.0.1".parse().unwrap()));
        assert_eq!(msg.max_forwards(), Some(70));
        assert_eq!(msg.body(), "v=0\r");
        assert!(msg.has_sdp());
    }

    #[test]
    fn test_serialize_recomputes_length() {
        let mut msg = SipMessage::parse(INVITE).unwrap();
        msg.set_body("v=0\r\ns=-\r\n");
        let text = msg.to_string();
        assert!(text.contains("Content-Length: 10\r\n\r\nv=0\r\ns=-\r\n"));
        assert_eq!(text.matches("Content-Length").count(), 1);
        assert_eq!(SipMessage::parse(&text).unwrap().body(), "v=0\r\ns=-\r\n");
    }

    #[test]
    fn test_create_response() {
        let msg = SipMessage::parse(INVITE).unwrap();
        let trying = msg.create_response(100, "Trying");
        assert_eq!(trying.to_tag(), None);

        let ok = msg.create_response(200, "OK");
        assert_eq!(ok.status(), Some(200));
        assert!(ok.to_tag().is_some());
        assert_eq!(ok.call_id(), msg.call_id());
        assert_eq!(ok.top_via_branch(), msg.top_via_branch());
        assert!(!ok.has_header("contact"));
    }

    #[test]
    fn test_header_editing() {
        let mut msg = SipMessage::parse(INVITE).unwrap();
        msg.prepend_header("Via", "SIP/2.0/UDP 192.0.2.1;branch=z9hG4bKtop");
        assert_eq!(msg.top_via_branch().as_deref(), Some("z9hG4bKtop"));
        assert_eq!(msg.header_list("v").len(), 2);

        msg.set_top_via_branch("z9hG4bKnew").unwrap();
        assert_eq!(msg.top_via_branch().as_deref(), Some("z9hG4bKnew"));

        msg.set_header("Route", "<sip:p1;lr>, <sip:p2;lr>");
        assert_eq!(msg.header_list("route"), vec!["<sip:p1;lr>", "<sip:p2;lr>"]);
        msg.remove_header("route");
        assert!(!msg.has_header("Route"));
    }

    #[test]
    fn test_parse_response() {
        let msg = SipMessage::parse("SIP/2.0 180 Ringing\r\nTo: <sip:b@x>;tag=abc\r\n\r\n").unwrap();
        assert_eq!(msg.status(), Some(180));
        assert_eq!(msg.reason(), Some("Ringing"));
        assert!(msg.is_1xx());
        assert!(msg.is_mid_dialog());
        assert!(!msg.is_error_response());
    }

    #[test]
    fn test_malformed() {
        assert!(SipMessage::parse("").is_err());
        assert!(SipMessage::parse("INVITE sip:a@b\r\n\r\n").is_err());
        assert!(SipMessage::parse("INVITE sip:a@b SIP/2.0\r\nNoColon\r\n\r\n").is_err());
    }

    #[test]
    fn test_tags_and_uris() {
        assert_eq!(tag_of("<sip:a@b;transport=tcp>;tag=xyz").as_deref(), Some("xyz"));
        assert_eq!(tag_of("sip:a@b;tag=q1").as_deref(), Some("q1"));
        assert_eq!(tag_of("<sip:a@b;tag=inside>"), None);
        assert_eq!(uri_of("\"Bob\" <sip:bob@host:5070>;tag=1"), "sip:bob@host:5070");
    }

    #[test]
    fn test_sip_uri() {
        let uri = SipUri::parse("<sip:abc123-1@192.168.0.10:5070;transport=tcp;lr>").unwrap();
        assert_eq!(uri.user.as_deref(), Some("abc123-1"));
        assert_eq!(uri.host, "192.168.0.10");
        assert_eq!(uri.port, Some(5070));
        assert_eq!(uri.transport(), Some(Transport::Tcp));
        assert!(uri.has_param("lr"));
        assert_eq!(uri.to_string(), "sip:abc123-1@192.168.0.10:5070;transport=tcp;lr");

        let v6 = SipUri::parse("sips:[2001:db8::1]:5061").unwrap();
        assert!(v6.is_secure());
        assert_eq!(v6.ip(), Some("2001:db8::1".parse().unwrap()));
        assert_eq!(v6.to_string(), "sips:[2001:db8::1]:5061");

        assert!(SipUri::parse("nohost").is_err());
    }
}
