//! Code execution proxy backed by a Judge0 instance.
//!
//! ```text
//! ExecuteRequest ─► validate ─► POST /submissions ─► token
//!                                                     │
//!                 ExecuteResponse ◄── GET /submissions/{token} (poll)
//! ```
//!
//! Runs outside the hub. Remote failures are reported through
//! [`ExecuteResponse::status`]; only requests that are invalid before any
//! network call surface as [`ExecuteError`].

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use reqwest::Client;
use serde::{Deserialize, Serialize};

use crate::config::{parse_var, ConfigError};

const DEFAULT_BASE_URL: &str = "https://judge0-ce.p.rapidapi.com";
const RAPIDAPI_HOST: &str = "judge0-ce.p.rapidapi.com";

/// Judge0 status ids at or below this are still queued or running.
const LAST_PENDING_STATUS: u32 = 2;
const ACCEPTED_STATUS: u32 = 3;

/// Execution errors raised before the remote service is contacted.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ExecuteError {
    #[error("Code must not be blank")]
    BlankCode,
    #[error("HTTP client error: {0}")]
    Client(String),
}

/// Executor configuration. The API key is redacted in Debug output.
#[derive(Clone)]
pub struct ExecutorConfig {
    pub base_url: String,
    /// RapidAPI key, sent as `x-rapidapi-key`
    pub api_key: String,
    pub rapidapi_host: String,
    pub request_timeout: Duration,
    pub poll_interval: Duration,
    pub max_attempts: u32,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_BASE_URL.to_string(),
            api_key: String::new(),
            rapidapi_host: RAPIDAPI_HOST.to_string(),
            request_timeout: Duration::from_secs(30),
            poll_interval: Duration::from_secs(2),
            max_attempts: 10,
        }
    }
}

impl fmt::Debug for ExecutorConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExecutorConfig")
            .field("base_url", &self.base_url)
            .field("api_key", &"[REDACTED]")
            .field("rapidapi_host", &self.rapidapi_host)
            .field("request_timeout", &self.request_timeout)
            .field("poll_interval", &self.poll_interval)
            .field("max_attempts", &self.max_attempts)
            .finish()
    }
}

impl ExecutorConfig {
    /// Read `JUDGE0_URL`, `JUDGE0_KEY`, `JUDGE0_POLL_INTERVAL_MS` and
    /// `JUDGE0_MAX_ATTEMPTS` from the environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();
        let poll_ms: u64 = parse_var(&lookup, "JUDGE0_POLL_INTERVAL_MS", 2000)?;

        Ok(Self {
            base_url: lookup("JUDGE0_URL").unwrap_or(defaults.base_url),
            api_key: lookup("JUDGE0_KEY").unwrap_or(defaults.api_key),
            poll_interval: Duration::from_millis(poll_ms),
            max_attempts: parse_var(&lookup, "JUDGE0_MAX_ATTEMPTS", defaults.max_attempts)?,
            ..defaults
        })
    }
}

/// Languages the executor knows how to submit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Language {
    Go,
    Python,
    JavaScript,
    Java,
}

impl Language {
    /// Judge0 language id.
    pub fn judge_id(self) -> u32 {
        match self {
            Language::Go => 95,
            Language::Python => 92,
            Language::JavaScript => 93,
            Language::Java => 91,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Language::Go => "go",
            Language::Python => "python",
            Language::JavaScript => "javascript",
            Language::Java => "java",
        }
    }
}

impl FromStr for Language {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "go" => Ok(Language::Go),
            "python" => Ok(Language::Python),
            "javascript" => Ok(Language::JavaScript),
            "java" => Ok(Language::Java),
            other => Err(format!("Unsupported language: {other}")),
        }
    }
}

impl fmt::Display for Language {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome of an execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecStatus {
    Success,
    Error,
    Timeout,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecuteRequest {
    pub code: String,
    pub language: String,
    #[serde(default)]
    pub input: String,
}

impl ExecuteRequest {
    pub fn validate(&self) -> Result<(), ExecuteError> {
        if self.code.trim().is_empty() {
            return Err(ExecuteError::BlankCode);
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecuteResponse {
    pub output: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub error: String,
    pub exit_code: i32,
    pub runtime: String,
    pub status: ExecStatus,
}

impl ExecuteResponse {
    fn failed(status: ExecStatus, error: impl Into<String>) -> Self {
        Self {
            output: String::new(),
            error: error.into(),
            exit_code: 0,
            runtime: String::new(),
            status,
        }
    }
}

#[derive(Serialize)]
struct Submission<'a> {
    source_code: &'a str,
    language_id: u32,
    #[serde(skip_serializing_if = "no_stdin")]
    stdin: &'a str,
}

fn no_stdin(stdin: &&str) -> bool {
    stdin.is_empty()
}

#[derive(Deserialize)]
struct SubmissionToken {
    token: String,
}

#[derive(Deserialize)]
struct SubmissionStatus {
    id: u32,
    #[serde(default)]
    description: String,
}

#[derive(Deserialize)]
struct SubmissionResult {
    status: SubmissionStatus,
    stdout: Option<String>,
    stderr: Option<String>,
    compile_output: Option<String>,
    time: Option<String>,
}

impl SubmissionResult {
    fn is_pending(&self) -> bool {
        self.status.id <= LAST_PENDING_STATUS
    }

    fn into_response(self) -> ExecuteResponse {
        let output = self.stdout.unwrap_or_default();
        let runtime = self.time.unwrap_or_default();

        if self.status.id == ACCEPTED_STATUS {
            return ExecuteResponse {
                output,
                error: String::new(),
                exit_code: 0,
                runtime,
                status: ExecStatus::Success,
            };
        }

        let error = [self.stderr, self.compile_output]
            .into_iter()
            .flatten()
            .find(|text| !text.is_empty())
            .unwrap_or(self.status.description);

        ExecuteResponse {
            output,
            error,
            exit_code: 1,
            runtime,
            status: ExecStatus::Error,
        }
    }
}

/// HTTP client for the remote judge.
#[derive(Debug, Clone)]
pub struct CodeExecutor {
    http: Client,
    config: ExecutorConfig,
}

impl CodeExecutor {
    pub fn new(config: ExecutorConfig) -> Result<Self, ExecuteError> {
        let http = Client::builder()
            .timeout(config.request_timeout)
            .build()
            .map_err(|e| ExecuteError::Client(e.to_string()))?;
        Ok(Self { http, config })
    }

    pub fn config(&self) -> &ExecutorConfig {
        &self.config
    }

    /// Submit `request` and wait for its result.
    ///
    /// Returns `Err` only for requests rejected before submission.
    pub async fn execute(&self, request: &ExecuteRequest) -> Result<ExecuteResponse, ExecuteError> {
        request.validate()?;

        let language = match request.language.parse::<Language>() {
            Ok(language) => language,
            Err(_) => {
                return Ok(ExecuteResponse::failed(ExecStatus::Error, "Unsupported language"));
            }
        };

        let token = match self.submit(request, language).await {
            Ok(token) => token,
            Err(e) => {
                log::warn!("Submission failed: {e}");
                return Ok(ExecuteResponse::failed(
                    ExecStatus::Error,
                    format!("Request failed: {e}"),
                ));
            }
        };
        log::debug!("Submitted {language} snippet as {token}");

        Ok(self.poll(&token).await)
    }

    async fn submit(&self, request: &ExecuteRequest, language: Language) -> reqwest::Result<String> {
        let body = Submission {
            source_code: &request.code,
            language_id: language.judge_id(),
            stdin: &request.input,
        };
        let submitted: SubmissionToken = self
            .http
            .post(self.url("submissions"))
            .header("x-rapidapi-host", &self.config.rapidapi_host)
            .header("x-rapidapi-key", &self.config.api_key)
            .json(&body)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        Ok(submitted.token)
    }

    async fn poll(&self, token: &str) -> ExecuteResponse {
        let url = self.url(&format!("submissions/{token}"));

        for attempt in 1..=self.config.max_attempts {
            let result = match self.fetch(&url).await {
                Ok(result) => result,
                Err(e) if e.is_decode() => {
                    return ExecuteResponse::failed(
                        ExecStatus::Error,
                        format!("Failed to decode response: {e}"),
                    );
                }
                Err(e) => {
                    return ExecuteResponse::failed(
                        ExecStatus::Error,
                        format!("Poll request failed: {e}"),
                    );
                }
            };

            if !result.is_pending() {
                return result.into_response();
            }

            log::trace!("Submission {token} pending (attempt {attempt})");
            if attempt < self.config.max_attempts {
                tokio::time::sleep(self.config.poll_interval).await;
            }
        }

        log::warn!("Submission {token} not finished after {} polls", self.config.max_attempts);
        ExecuteResponse::failed(ExecStatus::Timeout, "Execution timeout - result not ready")
    }

    async fn fetch(&self, url: &str) -> reqwest::Result<SubmissionResult> {
        self.http
            .get(url)
            .header("x-rapidapi-host", &self.config.rapidapi_host)
            .header("x-rapidapi-key", &self.config.api_key)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.config.base_url.trim_end_matches('/'), path)
    }
}
