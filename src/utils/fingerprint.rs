use std::fmt;
use std::net::IpAddr;

/// Coarse browser family derived from a User-Agent header
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AgentFamily {
    Chromium,
    Firefox,
    Safari,
    Other,
    Unknown,
}

impl AgentFamily {
    pub fn classify(user_agent: Option<&str>) -> Self {
        let Some(ua) = user_agent.map(str::trim).filter(|ua| !ua.is_empty()) else {
            return AgentFamily::Unknown;
        };
        let ua = ua.to_lowercase();

        // Chromium-based agents also advertise "safari/", so they are checked first
        if ["edg/", "chrome/", "chromium/", "opr/", "crios/"]
            .iter()
            .any(|marker| ua.contains(marker))
        {
            AgentFamily::Chromium
        } else if ua.contains("firefox/") || ua.contains("fxios/") {
            AgentFamily::Firefox
        } else if ua.contains("safari/") {
            AgentFamily::Safari
        } else {
            AgentFamily::Other
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            AgentFamily::Chromium => "chromium",
            AgentFamily::Firefox => "firefox",
            AgentFamily::Safari => "safari",
            AgentFamily::Other => "other",
            AgentFamily::Unknown => "unknown",
        }
    }
}

impl fmt::Display for AgentFamily {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What identifies an inbound upload for session tracking and duplicate detection
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RequestFingerprint {
    pub client_addr: IpAddr,
    pub content_length: Option<u64>,
    pub agent_family: AgentFamily,
}

impl RequestFingerprint {
    pub fn new(client_addr: IpAddr, content_length: Option<u64>, user_agent: Option<&str>) -> Self {
        Self {
            client_addr,
            content_length,
            agent_family: AgentFamily::classify(user_agent),
        }
    }
}
