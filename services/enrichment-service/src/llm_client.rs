use models::{EmailClassification, QueueItem};
use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};

#[derive(Clone)]
pub struct LLMClient {
    api_key: Option<String>,
    client: reqwest::Client,
}

#[derive(Serialize)]
struct OpenAIRequest {
    model: String,
    messages: Vec<OpenAIMessage>,
    temperature: f32,
}

#[derive(Serialize, Deserialize)]
struct OpenAIMessage {
    role: String,
    content: String,
}

#[derive(Deserialize)]
struct OpenAIResponse {
    choices: Vec<OpenAIChoice>,
}

#[derive(Deserialize)]
struct OpenAIChoice {
    message: OpenAIMessage,
}

const CLASSIFY_SYSTEM_PROMPT: &str = r#"
You are a customer-support email triage agent. Analyze the email and classify it.

Respond in JSON format:
{
    "category": "billing|technical|account|general",
    "priority": "urgent|high|normal|low",
    "intent": "question|request|complaint|information",
    "sentiment": "positive|neutral|negative",
    "entities": ["order numbers, product names, account ids mentioned"],
    "recommended_actions": ["short imperative next steps for the agent"],
    "suggested_assignee": "team or null",
    "confidence": 0.0
}
"#;

const DRAFT_SYSTEM_PROMPT: &str = r#"
You are a customer-support agent writing a reply draft. Be concise, polite and
concrete. Acknowledge the customer's issue, state what happens next, and sign
off as "Support Team". Respond with the reply text only, no JSON.
"#;

impl LLMClient {
    pub fn new(api_key: Option<String>) -> Self {
        Self {
            api_key,
            client: reqwest::Client::new(),
        }
    }

    /// Classify one email. Falls back to keyword matching when no API key
    /// is configured or the model reply is unusable.
    pub async fn classify_email(
        &self,
        item: &QueueItem,
    ) -> Result<EmailClassification, Box<dyn std::error::Error + Send + Sync>> {
        if let Some(api_key) = &self.api_key {
            self.classify_with_openai(item, api_key).await
        } else {
            warn!("No OpenAI API key available, using keyword classification");
            Ok(keyword_classification(&item.subject, &item.body))
        }
    }

    /// Generate a reply draft for one email.
    pub async fn draft_reply(
        &self,
        item: &QueueItem,
    ) -> Result<String, Box<dyn std::error::Error + Send + Sync>> {
        if let Some(api_key) = &self.api_key {
            self.draft_with_openai(item, api_key).await
        } else {
            warn!("No OpenAI API key available, using template draft");
            Ok(template_draft(item))
        }
    }

    async fn classify_with_openai(
        &self,
        item: &QueueItem,
        api_key: &str,
    ) -> Result<EmailClassification, Box<dyn std::error::Error + Send + Sync>> {
        let content = self.chat(api_key, CLASSIFY_SYSTEM_PROMPT, &email_prompt(item)).await?;

        match serde_json::from_str::<EmailClassification>(&content) {
            Ok(classification) => {
                info!("Classified email {} as {}", item.email_id, classification.category);
                Ok(classification)
            }
            Err(e) => {
                warn!("Failed to parse classification response: {}, using keyword fallback", e);
                Ok(keyword_classification(&item.subject, &item.body))
            }
        }
    }

    async fn draft_with_openai(
        &self,
        item: &QueueItem,
        api_key: &str,
    ) -> Result<String, Box<dyn std::error::Error + Send + Sync>> {
        let content = self.chat(api_key, DRAFT_SYSTEM_PROMPT, &email_prompt(item)).await?;
        if content.trim().is_empty() {
            warn!("Empty draft from model, using template fallback");
            return Ok(template_draft(item));
        }
        Ok(content)
    }

    async fn chat(
        &self,
        api_key: &str,
        system_prompt: &str,
        user_prompt: &str,
    ) -> Result<String, Box<dyn std::error::Error + Send + Sync>> {
        let request = OpenAIRequest {
            model: "gpt-4o-mini".to_string(),
            messages: vec![
                OpenAIMessage {
                    role: "system".to_string(),
                    content: system_prompt.to_string(),
                },
                OpenAIMessage {
                    role: "user".to_string(),
                    content: user_prompt.to_string(),
                },
            ],
            temperature: 0.2,
        };

        let response = self
            .client
            .post("https://api.openai.com/v1/chat/completions")
            .header("Authorization", format!("Bearer {}", api_key))
            .header("Content-Type", "application/json")
            .json(&request)
            .send()
            .await?;

        if !response.status().is_success() {
            error!("OpenAI API error: {}", response.status());
            return Err(format!("OpenAI API error: {}", response.status()).into());
        }

        let openai_response: OpenAIResponse = response.json().await?;
        let choice = openai_response
            .choices
            .into_iter()
            .next()
            .ok_or("No choices in OpenAI response")?;
        Ok(choice.message.content)
    }
}

fn email_prompt(item: &QueueItem) -> String {
    format!(
        "From: {} <{}>\nSubject: {}\n\n{}",
        item.from_name.as_deref().unwrap_or(""),
        item.from_address,
        item.subject,
        item.body
    )
}

/// Keyword-matching classifier, used whenever the LLM is unavailable or
/// returns something unparsable.
pub fn keyword_classification(subject: &str, body: &str) -> EmailClassification {
    let text = format!("{} {}", subject, body).to_lowercase();

    let contains_any = |keywords: &[&str]| keywords.iter().any(|k| text.contains(k));

    let category = if contains_any(&["invoice", "billing", "payment", "refund", "charge", "subscription"]) {
        "billing"
    } else if contains_any(&["error", "bug", "crash", "broken", "not working", "fails", "exception"]) {
        "technical"
    } else if contains_any(&["password", "login", "sign in", "account", "locked out", "2fa"]) {
        "account"
    } else {
        "general"
    };

    let priority = if contains_any(&["urgent", "asap", "immediately", "outage", "down", "critical"]) {
        "urgent"
    } else if contains_any(&["important", "priority", "blocked", "deadline"]) {
        "high"
    } else {
        "normal"
    };

    let sentiment = if contains_any(&["angry", "frustrated", "terrible", "unacceptable", "worst", "disappointed"]) {
        "negative"
    } else if contains_any(&["thanks", "thank you", "great", "love", "appreciate"]) {
        "positive"
    } else {
        "neutral"
    };

    let intent = if contains_any(&["complaint", "unacceptable", "disappointed"]) {
        "complaint"
    } else if contains_any(&["please", "could you", "can you", "i need", "request"]) {
        "request"
    } else if text.contains('?') || contains_any(&["how do", "how can", "what is", "why"]) {
        "question"
    } else {
        "information"
    };

    // Order/ticket references, e.g. "#1234"
    let entities: Vec<String> = text
        .split_whitespace()
        .filter(|token| {
            token.starts_with('#') && token.len() > 1 && token[1..].chars().all(|c| c.is_ascii_digit())
        })
        .map(|token| token.to_string())
        .collect();

    let recommended_actions = match category {
        "billing" => vec!["Review the account's billing history".to_string()],
        "technical" => vec!["Reproduce the reported issue".to_string()],
        "account" => vec!["Verify the requester's identity".to_string()],
        _ => vec!["Route to general support queue".to_string()],
    };

    let suggested_assignee = match category {
        "billing" => Some("billing-team".to_string()),
        "technical" => Some("support-engineering".to_string()),
        _ => None,
    };

    EmailClassification {
        category: category.to_string(),
        priority: priority.to_string(),
        intent: intent.to_string(),
        sentiment: sentiment.to_string(),
        entities,
        recommended_actions,
        suggested_assignee,
        // Keyword matching is a coarse signal.
        confidence: 0.4,
    }
}

/// Minimal acknowledgement draft used when no model is available.
pub fn template_draft(item: &QueueItem) -> String {
    let name = item
        .from_name
        .as_deref()
        .filter(|n| !n.is_empty())
        .unwrap_or("there");
    format!(
        "Hi {},\n\nThanks for reaching out about \"{}\". We've received your \
message and a member of our team is looking into it. We'll get back to you \
as soon as we have an update.\n\nBest regards,\nSupport Team",
        name, item.subject
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use models::JobStatus;
    use uuid::Uuid;

    fn item(subject: &str, body: &str) -> QueueItem {
        QueueItem {
            id: Uuid::new_v4(),
            email_id: Uuid::new_v4(),
            ticket_id: Uuid::new_v4(),
            subject: subject.to_string(),
            body: body.to_string(),
            from_address: "customer@example.com".to_string(),
            from_name: Some("Pat".to_string()),
            status: JobStatus::Pending,
            retry_count: 0,
            max_retries: 3,
            priority: 100,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            error_message: None,
        }
    }

    #[test]
    fn test_keyword_classification_billing_urgent() {
        let c = keyword_classification(
            "Urgent: double charge on my invoice",
            "I was charged twice, please refund ASAP.",
        );
        assert_eq!(c.category, "billing");
        assert_eq!(c.priority, "urgent");
        assert_eq!(c.suggested_assignee.as_deref(), Some("billing-team"));
    }

    #[test]
    fn test_keyword_classification_extracts_order_numbers() {
        let c = keyword_classification("Order question", "Where is my order #1234?");
        assert_eq!(c.entities, vec!["#1234".to_string()]);
        assert_eq!(c.intent, "question");
    }

    #[test]
    fn test_keyword_classification_defaults() {
        let c = keyword_classification("Hello", "Just writing to say everything is fine.");
        assert_eq!(c.category, "general");
        assert_eq!(c.priority, "normal");
        assert_eq!(c.sentiment, "neutral");
        assert!(c.entities.is_empty());
        assert!(c.confidence < 0.5);
    }

    #[test]
    fn test_keyword_classification_negative_sentiment() {
        let c = keyword_classification("Complaint", "This is unacceptable, I am very frustrated.");
        assert_eq!(c.sentiment, "negative");
        assert_eq!(c.intent, "complaint");
    }

    #[test]
    fn test_template_draft_uses_name_and_subject() {
        let draft = template_draft(&item("Broken export", "The CSV export fails."));
        assert!(draft.contains("Hi Pat,"));
        assert!(draft.contains("Broken export"));
    }

    #[test]
    fn test_template_draft_without_name() {
        let mut i = item("Login issue", "Cannot sign in.");
        i.from_name = None;
        assert!(template_draft(&i).contains("Hi there,"));
    }
}
