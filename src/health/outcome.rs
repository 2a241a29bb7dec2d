//! Result of one completed call, as reported by the transport.

use std::time::Duration;

/// Health statistics a peer mirrors back in its response.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct PeerStats {
    pub latency_ms: f64,
    pub error_ratio: f64,
    pub degrade_ratio: f64,
}

/// What the core learns from one call.
#[derive(Debug, Clone, PartialEq)]
pub struct CallOutcome {
    pub success: bool,
    /// Latency observed by the client.
    pub latency: Duration,
    /// Latency reported by the server, when it reports one.
    pub server_latency: Option<Duration>,
    /// True when the server shed or degraded this request.
    pub server_degraded: bool,
    pub mirrored: Option<PeerStats>,
    /// Upper bound on the provider weight requested by the remote side.
    pub target_weight_hint: Option<u32>,
    /// The call was a streaming exchange rather than a single reply.
    pub stream: bool,
}

impl CallOutcome {
    pub fn success(latency: Duration) -> Self {
        Self {
            success: true,
            latency,
            server_latency: None,
            server_degraded: false,
            mirrored: None,
            target_weight_hint: None,
            stream: false,
        }
    }

    pub fn failure(latency: Duration) -> Self {
        Self {
            success: false,
            ..Self::success(latency)
        }
    }

    pub fn with_server_latency(mut self, latency: Duration) -> Self {
        self.server_latency = Some(latency);
        self
    }

    pub fn with_mirrored(mut self, stats: PeerStats) -> Self {
        self.mirrored = Some(stats);
        self
    }

    pub fn with_target_weight_hint(mut self, hint: u32) -> Self {
        self.target_weight_hint = Some(hint);
        self
    }

    pub fn streamed(mut self) -> Self {
        self.stream = true;
        self
    }

    pub fn degraded(mut self) -> Self {
        self.server_degraded = true;
        self
    }

    pub fn latency_ms(&self) -> f64 {
        self.latency.as_secs_f64() * 1_000.0
    }

    pub fn server_latency_ms(&self) -> f64 {
        match (self.server_latency, self.mirrored) {
            (Some(latency), _) => latency.as_secs_f64() * 1_000.0,
            (None, Some(stats)) => stats.latency_ms,
            (None, None) => self.latency_ms(),
        }
    }

    pub fn error_sample(&self) -> f64 {
        if self.success {
            0.0
        } else {
            1.0
        }
    }

    pub fn server_error_sample(&self) -> f64 {
        self.mirrored
            .map(|stats| stats.error_ratio)
            .unwrap_or_else(|| self.error_sample())
    }

    pub fn degrade_sample(&self) -> f64 {
        match self.mirrored {
            Some(stats) => stats.degrade_ratio.max(if self.server_degraded { 1.0 } else { 0.0 }),
            None if self.server_degraded => 1.0,
            None => 0.0,
        }
    }
}
