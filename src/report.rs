use crate::error::{Result, TrapcamError};
use crate::recorder::SessionRecord;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::time::Duration;
use tracing::{debug, info};

/// Outcome of a processed stream, condensed for the tagging service
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MotionOutcome {
    pub motion: bool,
    /// Trigger-to-last-frame sequence ranges of each session
    pub ranges: Vec<(u64, u64)>,
}

impl MotionOutcome {
    pub fn from_sessions(sessions: &[SessionRecord]) -> Self {
        Self {
            motion: !sessions.is_empty(),
            ranges: sessions
                .iter()
                .map(|s| (s.first_seq, s.last_seq))
                .collect(),
        }
    }

    fn label(&self) -> &'static str {
        if self.motion {
            "motion"
        } else {
            "no_motion"
        }
    }

    fn to_tag(&self) -> serde_json::Value {
        json!({
            "what": self.label(),
            "confidence": 1.0,
            "ranges": self.ranges,
        })
    }
}

/// Client for the external recording-tagging service.
///
/// Token-based: `authenticate` first, then tag. All failures come back as
/// API errors; nothing here touches the recording pipeline.
pub struct TagApi {
    base_url: String,
    agent: ureq::Agent,
    token: Option<String>,
}

impl TagApi {
    pub fn new(base_url: &str) -> Self {
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            agent: ureq::AgentBuilder::new()
                .timeout(Duration::from_secs(10))
                .build(),
            token: None,
        }
    }

    pub fn is_authenticated(&self) -> bool {
        self.token.is_some()
    }

    /// Exchange credentials for a bearer token
    pub fn authenticate(&mut self, user: &str, password: &str) -> Result<()> {
        let url = format!("{}/authenticate_user", self.base_url);
        debug!("Authenticating against {}", url);

        let response = self
            .agent
            .post(&url)
            .send_json(json!({ "userName": user, "password": password }))
            .map_err(|e| TrapcamError::api(format!("authentication request failed: {}", e)))?;

        let body: serde_json::Value = response
            .into_json()
            .map_err(|e| TrapcamError::api(format!("authentication response unreadable: {}", e)))?;
        let token = body
            .get("token")
            .and_then(|t| t.as_str())
            .ok_or_else(|| TrapcamError::api("authentication response carried no token"))?;

        self.token = Some(token.to_string());
        info!("Authenticated with tagging service");
        Ok(())
    }

    /// Attach a motion outcome tag to an upstream recording
    pub fn tag_recording(&self, recording_id: &str, outcome: &MotionOutcome) -> Result<()> {
        let token = self
            .token
            .as_ref()
            .ok_or_else(|| TrapcamError::api("tag_recording called before authenticate"))?;

        let url = format!(
            "{}/api/v1/recordings/{}/tags",
            self.base_url, recording_id
        );
        self.agent
            .post(&url)
            .set("Authorization", &format!("Bearer {}", token))
            .send_json(outcome.to_tag())
            .map_err(|e| TrapcamError::api(format!("tagging request failed: {}", e)))?;

        info!(
            "Tagged recording {} as '{}' ({} session(s))",
            recording_id,
            outcome.label(),
            outcome.ranges.len()
        );
        Ok(())
    }
}
