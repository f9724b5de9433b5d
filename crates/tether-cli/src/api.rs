//! REST collaborator: conversations, history and the plan-decision fallback

use anyhow::{Context, Result, bail};
use serde::Serialize;
use tether_wire::protocol::PromptResolution;
use tether_wire::{Conversation, ConversationId, Message, PlanDecision, ProjectId, PromptId, SessionId};

/// Thin client for the bridge service's HTTP API
#[derive(Clone)]
pub struct ApiClient {
    http: reqwest::Client,
    base_url: String,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct CreateConversation<'a> {
    #[serde(skip_serializing_if = "Option::is_none")]
    project_id: Option<&'a ProjectId>,
}

impl ApiClient {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}/api/{}", self.base_url, path.trim_start_matches('/'))
    }

    async fn check(resp: reqwest::Response, what: &str) -> Result<reqwest::Response> {
        if !resp.status().is_success() {
            let status = resp.status();
            let text = resp.text().await.unwrap_or_default();
            bail!("Failed to {}: {} {}", what, status, text);
        }
        Ok(resp)
    }

    pub async fn create_conversation(&self, project_id: Option<&ProjectId>) -> Result<Conversation> {
        let resp = self
            .http
            .post(self.url("conversations"))
            .json(&CreateConversation { project_id })
            .send()
            .await
            .context("Failed to reach the API")?;
        let resp = Self::check(resp, "create conversation").await?;
        Ok(resp.json().await?)
    }

    pub async fn list_conversations(&self, project_id: Option<&ProjectId>) -> Result<Vec<Conversation>> {
        let mut request = self.http.get(self.url("conversations"));
        if let Some(project_id) = project_id {
            request = request.query(&[("projectId", project_id.as_str())]);
        }
        let resp = request.send().await.context("Failed to reach the API")?;
        let resp = Self::check(resp, "list conversations").await?;
        Ok(resp.json().await?)
    }

    /// Persisted messages of a conversation, optionally scoped to a session
    pub async fn fetch_history(
        &self,
        conversation_id: &ConversationId,
        session_id: Option<&SessionId>,
    ) -> Result<Vec<Message>> {
        let mut request = self
            .http
            .get(self.url(&format!("conversations/{}/messages", conversation_id)));
        if let Some(session_id) = session_id {
            request = request.query(&[("sessionId", session_id.as_str())]);
        }
        let resp = request.send().await.context("Failed to reach the API")?;
        let resp = Self::check(resp, "fetch history").await?;
        Ok(resp.json().await?)
    }

    /// Submit a plan-review decision over HTTP when the channel is down
    pub async fn submit_plan_decision(&self, prompt_id: &PromptId, decision: &PlanDecision) -> Result<()> {
        let body = PromptResolution::new(prompt_id.clone(), &decision.clone().into());
        let resp = self
            .http
            .post(self.url(&format!("prompts/{}/plan-decision", prompt_id)))
            .json(&body)
            .send()
            .await
            .context("Failed to reach the API")?;
        Self::check(resp, "submit plan decision").await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_url_joins_without_double_slashes() {
        let api = ApiClient::new("http://localhost:3001/");
        assert_eq!(api.url("conversations"), "http://localhost:3001/api/conversations");
        assert_eq!(
            api.url("/prompts/p1/plan-decision"),
            "http://localhost:3001/api/prompts/p1/plan-decision"
        );
    }

    #[test]
    fn test_create_body_omits_missing_project() {
        let body = serde_json::to_value(CreateConversation { project_id: None }).unwrap();
        assert_eq!(body, serde_json::json!({}));

        let project = ProjectId::from("p1");
        let body = serde_json::to_value(CreateConversation {
            project_id: Some(&project),
        })
        .unwrap();
        assert_eq!(body, serde_json::json!({"projectId": "p1"}));
    }
}
