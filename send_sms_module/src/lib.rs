//! Outbound SMS delivery through the Twilio REST API.

use std::env;
use std::time::Duration;

use serde::Deserialize;
use tracing::info;

const DEFAULT_API_BASE: &str = "https://api.twilio.com";

#[derive(Debug, Clone)]
pub struct SendSmsParams {
    pub to: String,
    pub from: String,
    pub body: String,
}

#[derive(Debug, Clone)]
pub struct SendSmsResponse {
    pub message_sid: String,
    pub status: Option<String>,
}

#[derive(Debug, thiserror::Error)]
pub enum SendSmsError {
    #[error("missing environment variable: {0}")]
    MissingEnv(&'static str),
    #[error("invalid sms params: {0}")]
    InvalidParams(&'static str),
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("twilio api error {status}: {body}")]
    Api { status: u16, body: String },
}

#[derive(Debug, Deserialize)]
struct TwilioMessageResponse {
    sid: Option<String>,
    status: Option<String>,
}

#[derive(Debug, Clone)]
pub struct TwilioClient {
    account_sid: String,
    auth_token: String,
    api_base: String,
    http: reqwest::blocking::Client,
}

impl TwilioClient {
    pub fn new(
        account_sid: impl Into<String>,
        auth_token: impl Into<String>,
        api_base: impl Into<String>,
    ) -> Result<Self, SendSmsError> {
        let http = reqwest::blocking::Client::builder()
            .timeout(Duration::from_secs(15))
            .build()?;
        Ok(Self {
            account_sid: account_sid.into(),
            auth_token: auth_token.into(),
            api_base: api_base.into(),
            http,
        })
    }

    /// Builds a client from `TWILIO_ACCOUNT_SID`, `TWILIO_AUTH_TOKEN` and the
    /// optional `TWILIO_API_BASE_URL`.
    pub fn from_env() -> Result<Self, SendSmsError> {
        dotenvy::dotenv().ok();
        let account_sid =
            env_non_empty("TWILIO_ACCOUNT_SID").ok_or(SendSmsError::MissingEnv("TWILIO_ACCOUNT_SID"))?;
        let auth_token =
            env_non_empty("TWILIO_AUTH_TOKEN").ok_or(SendSmsError::MissingEnv("TWILIO_AUTH_TOKEN"))?;
        let api_base =
            env_non_empty("TWILIO_API_BASE_URL").unwrap_or_else(|| DEFAULT_API_BASE.to_string());
        Self::new(account_sid, auth_token, api_base)
    }

    pub fn send(&self, params: &SendSmsParams) -> Result<SendSmsResponse, SendSmsError> {
        let to = params.to.trim();
        let from = params.from.trim();
        let body = params.body.trim();
        if to.is_empty() {
            return Err(SendSmsError::InvalidParams("to number missing"));
        }
        if from.is_empty() {
            return Err(SendSmsError::InvalidParams("from number missing"));
        }
        if body.is_empty() {
            return Err(SendSmsError::InvalidParams("message body empty"));
        }

        let url = format!(
            "{}/2010-04-01/Accounts/{}/Messages.json",
            self.api_base.trim_end_matches('/'),
            self.account_sid
        );
        let response = self
            .http
            .post(&url)
            .basic_auth(&self.account_sid, Some(&self.auth_token))
            .form(&[("To", to), ("From", from), ("Body", body)])
            .send()?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().unwrap_or_default();
            return Err(SendSmsError::Api {
                status: status.as_u16(),
                body,
            });
        }

        let parsed: TwilioMessageResponse = response.json()?;
        let message_sid = parsed.sid.unwrap_or_default();
        info!("sent SMS message to {} sid={}", to, message_sid);
        Ok(SendSmsResponse {
            message_sid,
            status: parsed.status,
        })
    }
}

/// One-shot send using credentials from the environment.
pub fn send_sms(params: &SendSmsParams) -> Result<SendSmsResponse, SendSmsError> {
    TwilioClient::from_env()?.send(params)
}

fn env_non_empty(key: &str) -> Option<String> {
    env::var(key)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}
