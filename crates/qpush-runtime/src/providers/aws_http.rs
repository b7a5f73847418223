//! HTTP clients for the SQS and SNS Query APIs.
//!
//! Requests are `POST`s whose parameters travel as a form-encoded body, signed
//! with AWS Signature Version 4. Responses are XML and parsed with `quick-xml`.
//! Going over HTTP directly keeps the clients testable against a mock server
//! and lets an endpoint override point them at LocalStack.

use super::aws::{
    PublishRequest, ReceiveMessageRequest, SendMessageRequest, SnsApi, SnsSubscription, SqsApi,
    SqsMessage,
};
use crate::error::{ConfigurationError, QueueError, SerializationError};
use crate::provider::AwsConfig;
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use hmac::{Hmac, Mac};
use quick_xml::events::Event;
use quick_xml::Reader;
use reqwest::Client as HttpClient;
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use tracing::debug;

#[cfg(test)]
#[path = "aws_http_tests.rs"]
mod tests;

const SQS_API_VERSION: &str = "2012-11-05";
const SNS_API_VERSION: &str = "2010-03-31";

/// Request timeout; must exceed the longest SQS long poll
const REQUEST_TIMEOUT_SECS: u64 = 30;
const FORM_CONTENT_TYPE: &str = "application/x-www-form-urlencoded";

// ============================================================================
// Error Types
// ============================================================================

/// Errors raised by the AWS HTTP clients
#[derive(Debug, thiserror::Error)]
pub enum AwsError {
    #[error("Authentication failed: {0}")]
    Authentication(String),

    #[error("Network error: {0}")]
    NetworkError(String),

    #[error("Request timed out after {seconds}s")]
    Timeout { seconds: u64 },

    #[error("AWS service error {code}: {message}")]
    ServiceError { code: String, message: String },

    #[error("Resource not found: {0}")]
    NotFound(String),

    #[error("Invalid receipt handle: {0}")]
    InvalidReceipt(String),

    #[error("Invalid configuration: {0}")]
    ConfigurationError(String),

    #[error("Unexpected response: {0}")]
    SerializationError(String),
}

impl AwsError {
    /// Check if error is transient and should be retried
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Authentication(_) => false,
            Self::NetworkError(_) => true,
            Self::Timeout { .. } => true,
            Self::ServiceError { .. } => true,
            Self::NotFound(_) => false,
            Self::InvalidReceipt(_) => false,
            Self::ConfigurationError(_) => false,
            Self::SerializationError(_) => false,
        }
    }

    /// Map AWS error to QueueError
    pub fn to_queue_error(self) -> QueueError {
        match self {
            Self::Authentication(message) => QueueError::AuthenticationFailed { message },
            Self::NetworkError(message) => QueueError::ConnectionFailed { message },
            Self::Timeout { seconds } => QueueError::Timeout {
                duration: Duration::seconds(seconds as i64),
            },
            Self::ServiceError { code, message } => QueueError::ProviderError {
                provider: "aws".to_string(),
                code,
                message,
            },
            Self::NotFound(resource) => QueueError::QueueNotFound {
                queue_name: resource,
            },
            Self::InvalidReceipt(receipt) => QueueError::MessageNotFound { receipt },
            Self::ConfigurationError(message) => {
                QueueError::ConfigurationError(ConfigurationError::Invalid { message })
            }
            Self::SerializationError(message) => {
                QueueError::SerializationError(SerializationError::XmlError { message })
            }
        }
    }
}

impl From<AwsError> for QueueError {
    fn from(e: AwsError) -> Self {
        e.to_queue_error()
    }
}

// ============================================================================
// Credentials
// ============================================================================

/// Static access key pair used to sign requests
#[derive(Clone)]
pub struct AwsCredentials {
    access_key_id: String,
    secret_access_key: String,
}

impl AwsCredentials {
    pub fn new(access_key_id: impl Into<String>, secret_access_key: impl Into<String>) -> Self {
        Self {
            access_key_id: access_key_id.into(),
            secret_access_key: secret_access_key.into(),
        }
    }

    /// Credentials from configuration, falling back to `AWS_ACCESS_KEY_ID` and
    /// `AWS_SECRET_ACCESS_KEY`
    pub fn resolve(config: &AwsConfig) -> Result<Self, ConfigurationError> {
        let access_key_id = config
            .access_key_id
            .clone()
            .or_else(|| std::env::var("AWS_ACCESS_KEY_ID").ok())
            .filter(|v| !v.is_empty())
            .ok_or_else(|| ConfigurationError::Missing {
                key: "access_key_id".to_string(),
            })?;
        let secret_access_key = config
            .secret_access_key
            .clone()
            .or_else(|| std::env::var("AWS_SECRET_ACCESS_KEY").ok())
            .filter(|v| !v.is_empty())
            .ok_or_else(|| ConfigurationError::Missing {
                key: "secret_access_key".to_string(),
            })?;

        Ok(Self::new(access_key_id, secret_access_key))
    }

    pub fn access_key_id(&self) -> &str {
        &self.access_key_id
    }
}

impl fmt::Debug for AwsCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AwsCredentials")
            .field("access_key_id", &self.access_key_id)
            .field("secret_access_key", &"<REDACTED>")
            .finish()
    }
}

// ============================================================================
// AWS Signature V4 Signing
// ============================================================================

type HmacSha256 = Hmac<Sha256>;

/// AWS Signature Version 4 signer.
///
/// 1. Create canonical request (method, URI, query, headers, payload)
/// 2. Create string to sign (algorithm, timestamp, scope, request hash)
/// 3. Derive signing key (4-level HMAC chain)
/// 4. Calculate signature and build Authorization header
#[derive(Clone)]
struct AwsV4Signer {
    credentials: AwsCredentials,
    region: String,
    service: String,
}

impl AwsV4Signer {
    fn new(credentials: AwsCredentials, region: String, service: &str) -> Self {
        Self {
            credentials,
            region,
            service: service.to_string(),
        }
    }

    /// Headers (`Authorization`, `x-amz-date`, `host`, `content-type`) for a
    /// signed request
    fn sign_request(
        &self,
        method: &str,
        host: &str,
        path: &str,
        content_type: &str,
        body: &str,
        timestamp: &DateTime<Utc>,
    ) -> Result<HashMap<String, String>, AwsError> {
        let date_stamp = timestamp.format("%Y%m%d").to_string();
        let amz_date = timestamp.format("%Y%m%dT%H%M%SZ").to_string();

        // Parameters travel in the body, so the canonical query string is empty
        let canonical_query_string = "";
        let canonical_headers = format!(
            "content-type:{}\nhost:{}\nx-amz-date:{}\n",
            content_type, host, amz_date
        );
        let signed_headers = "content-type;host;x-amz-date";
        let payload_hash = format!("{:x}", Sha256::digest(body.as_bytes()));

        let canonical_request = format!(
            "{}\n{}\n{}\n{}\n{}\n{}",
            method, path, canonical_query_string, canonical_headers, signed_headers, payload_hash
        );

        let algorithm = "AWS4-HMAC-SHA256";
        let credential_scope = format!(
            "{}/{}/{}/aws4_request",
            date_stamp, self.region, self.service
        );
        let canonical_request_hash = format!("{:x}", Sha256::digest(canonical_request.as_bytes()));
        let string_to_sign = format!(
            "{}\n{}\n{}\n{}",
            algorithm, amz_date, credential_scope, canonical_request_hash
        );

        let signature = self.calculate_signature(&string_to_sign, &date_stamp)?;

        let authorization_header = format!(
            "{} Credential={}/{}, SignedHeaders={}, Signature={}",
            algorithm,
            self.credentials.access_key_id,
            credential_scope,
            signed_headers,
            signature
        );

        let mut headers = HashMap::new();
        headers.insert("Authorization".to_string(), authorization_header);
        headers.insert("x-amz-date".to_string(), amz_date);
        headers.insert("host".to_string(), host.to_string());
        headers.insert("content-type".to_string(), content_type.to_string());
        Ok(headers)
    }

    /// kSecret -> kDate -> kRegion -> kService -> kSigning -> signature
    fn calculate_signature(&self, string_to_sign: &str, date_stamp: &str) -> Result<String, AwsError> {
        let k_secret = format!("AWS4{}", self.credentials.secret_access_key);
        let k_date = hmac_sha256(k_secret.as_bytes(), date_stamp.as_bytes())?;
        let k_region = hmac_sha256(&k_date, self.region.as_bytes())?;
        let k_service = hmac_sha256(&k_region, self.service.as_bytes())?;
        let k_signing = hmac_sha256(&k_service, b"aws4_request")?;
        let signature = hmac_sha256(&k_signing, string_to_sign.as_bytes())?;
        Ok(hex::encode(signature))
    }
}

fn hmac_sha256(key: &[u8], data: &[u8]) -> Result<Vec<u8>, AwsError> {
    let mut mac = HmacSha256::new_from_slice(key)
        .map_err(|e| AwsError::ConfigurationError(format!("Invalid signing key: {}", e)))?;
    mac.update(data);
    Ok(mac.finalize().into_bytes().to_vec())
}

/// Sorted, percent-encoded `key=value` pairs
fn encode_query(params: &BTreeMap<String, String>) -> String {
    let mut pairs = params
        .iter()
        .map(|(k, v)| format!("{}={}", urlencoding::encode(k), urlencoding::encode(v)))
        .collect::<Vec<_>>();
    pairs.sort();
    pairs.join("&")
}

// ============================================================================
// Query API transport
// ============================================================================

/// Signed transport shared by the SQS and SNS clients
#[derive(Clone)]
struct QueryClient {
    http_client: HttpClient,
    signer: AwsV4Signer,
    endpoint: String,
    version: &'static str,
}

impl QueryClient {
    fn new(
        config: &AwsConfig,
        credentials: AwsCredentials,
        service: &str,
        version: &'static str,
    ) -> Result<Self, AwsError> {
        if config.region.is_empty() {
            return Err(AwsError::ConfigurationError(
                "Region cannot be empty".to_string(),
            ));
        }

        let endpoint = config
            .endpoint
            .clone()
            .unwrap_or_else(|| format!("https://{}.{}.amazonaws.com", service, config.region))
            .trim_end_matches('/')
            .to_string();

        let http_client = HttpClient::builder()
            .timeout(std::time::Duration::from_secs(REQUEST_TIMEOUT_SECS))
            .build()
            .map_err(|e| AwsError::NetworkError(format!("Failed to create HTTP client: {}", e)))?;

        Ok(Self {
            http_client,
            signer: AwsV4Signer::new(credentials, config.region.clone(), service),
            endpoint,
            version,
        })
    }

    fn host(&self) -> &str {
        self.endpoint
            .strip_prefix("https://")
            .or_else(|| self.endpoint.strip_prefix("http://"))
            .unwrap_or(&self.endpoint)
    }

    /// Invoke one Query API action and return the raw XML response
    async fn call(
        &self,
        action: &str,
        mut params: BTreeMap<String, String>,
    ) -> Result<String, AwsError> {
        params.insert("Action".to_string(), action.to_string());
        params.insert("Version".to_string(), self.version.to_string());

        let body = encode_query(&params);
        let timestamp = Utc::now();
        let auth_headers = self.signer.sign_request(
            "POST",
            self.host(),
            "/",
            FORM_CONTENT_TYPE,
            &body,
            &timestamp,
        )?;

        let url = format!("{}/", self.endpoint);
        let mut request = self.http_client.post(&url).body(body);
        for (key, value) in auth_headers {
            request = request.header(key, value);
        }

        let response = request.send().await.map_err(|e| {
            if e.is_timeout() {
                AwsError::Timeout {
                    seconds: REQUEST_TIMEOUT_SECS,
                }
            } else if e.is_connect() {
                AwsError::NetworkError(format!("Connection failed: {}", e))
            } else {
                AwsError::NetworkError(format!("HTTP request failed: {}", e))
            }
        })?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| AwsError::NetworkError(format!("Failed to read response body: {}", e)))?;

        if !status.is_success() {
            return Err(parse_error_response(&body, status.as_u16()));
        }

        debug!(action, service = %self.signer.service, "aws request completed");
        Ok(body)
    }
}

/// Numbered `<prefix>.N.Name` / `<prefix>.N.Value` parameters
fn push_attributes(
    params: &mut BTreeMap<String, String>,
    prefix: &str,
    key_field: &str,
    value_field: &str,
    attributes: &BTreeMap<String, String>,
) {
    for (i, (name, value)) in attributes.iter().enumerate() {
        params.insert(format!("{}.{}.{}", prefix, i + 1, key_field), name.clone());
        params.insert(format!("{}.{}.{}", prefix, i + 1, value_field), value.clone());
    }
}

fn required(value: Option<String>, element: &str) -> Result<String, AwsError> {
    value.ok_or_else(|| AwsError::SerializationError(format!("{} not found in response", element)))
}

// ============================================================================
// XML parsing
// ============================================================================

enum Node<'a> {
    Start(&'a str),
    Text { path: &'a [String], text: String },
    End(&'a str),
}

fn xml_error(e: impl fmt::Display) -> AwsError {
    AwsError::SerializationError(format!("XML parsing error: {}", e))
}

/// Stream the document, reporting element boundaries and text with the path
/// of enclosing element names
fn walk_xml<F>(xml: &str, mut visit: F) -> Result<(), AwsError>
where
    F: FnMut(Node<'_>),
{
    let mut reader = Reader::from_str(xml);
    reader.trim_text(true);

    let mut stack: Vec<String> = Vec::new();
    let mut buf = Vec::new();

    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(e)) => {
                let name = String::from_utf8_lossy(e.local_name().as_ref()).into_owned();
                visit(Node::Start(&name));
                stack.push(name);
            }
            Ok(Event::Text(e)) => {
                let text = e.unescape().map_err(xml_error)?.into_owned();
                visit(Node::Text { path: &stack, text });
            }
            Ok(Event::CData(e)) => {
                let text = String::from_utf8_lossy(&e.into_inner()).into_owned();
                visit(Node::Text { path: &stack, text });
            }
            Ok(Event::End(_)) => {
                if let Some(name) = stack.pop() {
                    visit(Node::End(&name));
                }
            }
            Ok(Event::Eof) => break,
            Err(e) => return Err(xml_error(e)),
            _ => {}
        }
        buf.clear();
    }

    Ok(())
}

fn leaf(path: &[String]) -> Option<&str> {
    path.last().map(String::as_str)
}

fn parent(path: &[String]) -> Option<&str> {
    path.len()
        .checked_sub(2)
        .and_then(|i| path.get(i))
        .map(String::as_str)
}

/// Text of the first element with the given name
fn first_text(xml: &str, element: &str) -> Result<Option<String>, AwsError> {
    let mut found = None;
    walk_xml(xml, |node| {
        if let Node::Text { path, text } = node {
            if found.is_none() && leaf(path) == Some(element) {
                found = Some(text);
            }
        }
    })?;
    Ok(found)
}

/// `<Attribute><Name/><Value/></Attribute>` pairs
fn parse_attributes(xml: &str) -> Result<BTreeMap<String, String>, AwsError> {
    let mut attributes = BTreeMap::new();
    let mut name: Option<String> = None;
    walk_xml(xml, |node| {
        if let Node::Text { path, text } = node {
            match (parent(path), leaf(path)) {
                (Some("Attribute"), Some("Name")) => name = Some(text),
                (Some("Attribute"), Some("Value")) => {
                    if let Some(name) = name.take() {
                        attributes.insert(name, text);
                    }
                }
                _ => {}
            }
        }
    })?;
    Ok(attributes)
}

fn parse_messages(xml: &str) -> Result<Vec<SqsMessage>, AwsError> {
    let mut messages = Vec::new();
    let mut current: Option<SqsMessage> = None;
    let mut attribute_name: Option<String> = None;

    walk_xml(xml, |node| match node {
        Node::Start("Message") => current = Some(SqsMessage::default()),
        Node::Text { path, text } => {
            if let Some(message) = current.as_mut() {
                match (parent(path), leaf(path)) {
                    (Some("Message"), Some("MessageId")) => message.message_id = text,
                    (Some("Message"), Some("ReceiptHandle")) => message.receipt_handle = text,
                    (Some("Message"), Some("MD5OfBody")) => message.md5_of_body = Some(text),
                    (Some("Message"), Some("Body")) => message.body = text,
                    (Some("Attribute"), Some("Name")) => attribute_name = Some(text),
                    (Some("Attribute"), Some("Value")) => {
                        if let Some(name) = attribute_name.take() {
                            message.attributes.insert(name, text);
                        }
                    }
                    _ => {}
                }
            }
        }
        Node::End("Message") => {
            if let Some(message) = current.take() {
                messages.push(message);
            }
        }
        _ => {}
    })?;

    Ok(messages)
}

fn parse_subscriptions(xml: &str) -> Result<(Vec<SnsSubscription>, Option<String>), AwsError> {
    let mut subscriptions = Vec::new();
    let mut next_token = None;
    let mut arn = String::new();
    let mut protocol = String::new();
    let mut endpoint = String::new();

    walk_xml(xml, |node| match node {
        Node::Start("member") => {
            arn.clear();
            protocol.clear();
            endpoint.clear();
        }
        Node::Text { path, text } => match (parent(path), leaf(path)) {
            (Some("member"), Some("SubscriptionArn")) => arn = text,
            (Some("member"), Some("Protocol")) => protocol = text,
            (Some("member"), Some("Endpoint")) => endpoint = text,
            (_, Some("NextToken")) => next_token = Some(text),
            _ => {}
        },
        Node::End("member") => subscriptions.push(SnsSubscription {
            subscription_arn: std::mem::take(&mut arn),
            protocol: std::mem::take(&mut protocol),
            endpoint: std::mem::take(&mut endpoint),
        }),
        _ => {}
    })?;

    Ok((subscriptions, next_token))
}

/// Map an `<ErrorResponse>` document to an error
fn parse_error_response(xml: &str, status_code: u16) -> AwsError {
    let mut code = None;
    let mut message = None;
    let _ = walk_xml(xml, |node| {
        if let Node::Text { path, text } = node {
            match (parent(path), leaf(path)) {
                (Some("Error"), Some("Code")) => code = Some(text),
                (Some("Error"), Some("Message")) => message = Some(text),
                _ => {}
            }
        }
    });

    let code = code.unwrap_or_else(|| "Unknown".to_string());
    let message = message.unwrap_or_else(|| "Unknown error".to_string());

    match code.as_str() {
        "AWS.SimpleQueueService.NonExistentQueue" | "QueueDoesNotExist" | "NotFound" => {
            AwsError::NotFound(message)
        }
        "InvalidClientTokenId"
        | "UnrecognizedClientException"
        | "SignatureDoesNotMatch"
        | "InvalidAccessKeyId"
        | "AuthorizationError"
        | "AccessDenied" => AwsError::Authentication(format!("{}: {}", code, message)),
        "InvalidReceiptHandle" | "ReceiptHandleIsInvalid" => AwsError::InvalidReceipt(message),
        _ if status_code == 401 || status_code == 403 => {
            AwsError::Authentication(format!("{}: {}", code, message))
        }
        _ => AwsError::ServiceError { code, message },
    }
}

// ============================================================================
// SQS
// ============================================================================

/// SQS client over the Query API
#[derive(Clone)]
pub struct HttpSqsClient {
    client: QueryClient,
}

impl HttpSqsClient {
    pub fn new(config: &AwsConfig, credentials: AwsCredentials) -> Result<Self, AwsError> {
        Ok(Self {
            client: QueryClient::new(config, credentials, "sqs", SQS_API_VERSION)?,
        })
    }

    pub fn endpoint(&self) -> &str {
        &self.client.endpoint
    }
}

impl fmt::Debug for HttpSqsClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HttpSqsClient")
            .field("endpoint", &self.client.endpoint)
            .field("region", &self.client.signer.region)
            .finish()
    }
}

fn queue_params(queue_url: &str) -> BTreeMap<String, String> {
    let mut params = BTreeMap::new();
    params.insert("QueueUrl".to_string(), queue_url.to_string());
    params
}

#[async_trait]
impl SqsApi for HttpSqsClient {
    async fn get_queue_url(&self, queue_name: &str) -> Result<Option<String>, QueueError> {
        let mut params = BTreeMap::new();
        params.insert("QueueName".to_string(), queue_name.to_string());

        match self.client.call("GetQueueUrl", params).await {
            Ok(xml) => Ok(Some(required(first_text(&xml, "QueueUrl")?, "QueueUrl")?)),
            Err(AwsError::NotFound(_)) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn create_queue(
        &self,
        queue_name: &str,
        attributes: &BTreeMap<String, String>,
    ) -> Result<String, QueueError> {
        let mut params = BTreeMap::new();
        params.insert("QueueName".to_string(), queue_name.to_string());
        push_attributes(&mut params, "Attribute", "Name", "Value", attributes);

        let xml = self.client.call("CreateQueue", params).await?;
        Ok(required(first_text(&xml, "QueueUrl")?, "QueueUrl")?)
    }

    async fn get_queue_arn(&self, queue_url: &str) -> Result<String, QueueError> {
        let mut params = queue_params(queue_url);
        params.insert("AttributeName.1".to_string(), "QueueArn".to_string());

        let xml = self.client.call("GetQueueAttributes", params).await?;
        let mut attributes = parse_attributes(&xml)?;
        Ok(required(attributes.remove("QueueArn"), "QueueArn")?)
    }

    async fn set_queue_attributes(
        &self,
        queue_url: &str,
        attributes: &BTreeMap<String, String>,
    ) -> Result<(), QueueError> {
        let mut params = queue_params(queue_url);
        push_attributes(&mut params, "Attribute", "Name", "Value", attributes);

        self.client.call("SetQueueAttributes", params).await?;
        Ok(())
    }

    async fn send_message(&self, request: SendMessageRequest) -> Result<String, QueueError> {
        let mut params = queue_params(&request.queue_url);
        params.insert("MessageBody".to_string(), request.body);
        if let Some(delay) = request.delay_seconds {
            params.insert("DelaySeconds".to_string(), delay.to_string());
        }
        if let Some(group) = request.message_group_id {
            params.insert("MessageGroupId".to_string(), group);
        }
        if let Some(dedup) = request.deduplication_id {
            params.insert("MessageDeduplicationId".to_string(), dedup);
        }

        let xml = self.client.call("SendMessage", params).await?;
        Ok(required(first_text(&xml, "MessageId")?, "MessageId")?)
    }

    async fn receive_message(
        &self,
        request: ReceiveMessageRequest,
    ) -> Result<Vec<SqsMessage>, QueueError> {
        let mut params = queue_params(&request.queue_url);
        params.insert(
            "MaxNumberOfMessages".to_string(),
            request.max_messages.to_string(),
        );
        params.insert(
            "WaitTimeSeconds".to_string(),
            request.wait_time_seconds.to_string(),
        );
        params.insert("AttributeName.1".to_string(), "All".to_string());
        if let Some(timeout) = request.visibility_timeout {
            params.insert("VisibilityTimeout".to_string(), timeout.to_string());
        }

        let xml = self.client.call("ReceiveMessage", params).await?;
        Ok(parse_messages(&xml)?)
    }

    async fn delete_message(
        &self,
        queue_url: &str,
        receipt_handle: &str,
    ) -> Result<(), QueueError> {
        let mut params = queue_params(queue_url);
        params.insert("ReceiptHandle".to_string(), receipt_handle.to_string());

        self.client.call("DeleteMessage", params).await?;
        Ok(())
    }

    async fn delete_queue(&self, queue_url: &str) -> Result<(), QueueError> {
        self.client
            .call("DeleteQueue", queue_params(queue_url))
            .await?;
        Ok(())
    }
}

// ============================================================================
// SNS
// ============================================================================

/// SNS client over the Query API
#[derive(Clone)]
pub struct HttpSnsClient {
    client: QueryClient,
}

impl HttpSnsClient {
    pub fn new(config: &AwsConfig, credentials: AwsCredentials) -> Result<Self, AwsError> {
        Ok(Self {
            client: QueryClient::new(config, credentials, "sns", SNS_API_VERSION)?,
        })
    }

    pub fn endpoint(&self) -> &str {
        &self.client.endpoint
    }
}

impl fmt::Debug for HttpSnsClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HttpSnsClient")
            .field("endpoint", &self.client.endpoint)
            .field("region", &self.client.signer.region)
            .finish()
    }
}

fn topic_params(topic_arn: &str) -> BTreeMap<String, String> {
    let mut params = BTreeMap::new();
    params.insert("TopicArn".to_string(), topic_arn.to_string());
    params
}

#[async_trait]
impl SnsApi for HttpSnsClient {
    async fn topic_exists(&self, topic_arn: &str) -> Result<bool, QueueError> {
        match self
            .client
            .call("GetTopicAttributes", topic_params(topic_arn))
            .await
        {
            Ok(_) => Ok(true),
            Err(AwsError::NotFound(_)) => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    async fn create_topic(
        &self,
        name: &str,
        attributes: &BTreeMap<String, String>,
    ) -> Result<String, QueueError> {
        let mut params = BTreeMap::new();
        params.insert("Name".to_string(), name.to_string());
        push_attributes(&mut params, "Attributes.entry", "key", "value", attributes);

        let xml = self.client.call("CreateTopic", params).await?;
        Ok(required(first_text(&xml, "TopicArn")?, "TopicArn")?)
    }

    async fn list_subscriptions_by_topic(
        &self,
        topic_arn: &str,
        next_token: Option<&str>,
    ) -> Result<(Vec<SnsSubscription>, Option<String>), QueueError> {
        let mut params = topic_params(topic_arn);
        if let Some(token) = next_token {
            params.insert("NextToken".to_string(), token.to_string());
        }

        let xml = self.client.call("ListSubscriptionsByTopic", params).await?;
        Ok(parse_subscriptions(&xml)?)
    }

    async fn subscribe(
        &self,
        topic_arn: &str,
        protocol: &str,
        endpoint: &str,
        attributes: &BTreeMap<String, String>,
    ) -> Result<String, QueueError> {
        let mut params = topic_params(topic_arn);
        params.insert("Protocol".to_string(), protocol.to_string());
        params.insert("Endpoint".to_string(), endpoint.to_string());
        params.insert("ReturnSubscriptionArn".to_string(), "true".to_string());
        push_attributes(&mut params, "Attributes.entry", "key", "value", attributes);

        let xml = self.client.call("Subscribe", params).await?;
        Ok(required(first_text(&xml, "SubscriptionArn")?, "SubscriptionArn")?)
    }

    async fn publish(&self, request: PublishRequest) -> Result<String, QueueError> {
        let mut params = topic_params(&request.topic_arn);
        params.insert("Message".to_string(), request.message);
        if let Some(structure) = request.message_structure {
            params.insert("MessageStructure".to_string(), structure);
        }
        if let Some(group) = request.message_group_id {
            params.insert("MessageGroupId".to_string(), group);
        }
        if let Some(dedup) = request.deduplication_id {
            params.insert("MessageDeduplicationId".to_string(), dedup);
        }

        let xml = self.client.call("Publish", params).await?;
        Ok(required(first_text(&xml, "MessageId")?, "MessageId")?)
    }

    async fn confirm_subscription(
        &self,
        topic_arn: &str,
        token: &str,
    ) -> Result<String, QueueError> {
        let mut params = topic_params(topic_arn);
        params.insert("Token".to_string(), token.to_string());

        let xml = self.client.call("ConfirmSubscription", params).await?;
        Ok(required(first_text(&xml, "SubscriptionArn")?, "SubscriptionArn")?)
    }

    async fn delete_topic(&self, topic_arn: &str) -> Result<(), QueueError> {
        self.client
            .call("DeleteTopic", topic_params(topic_arn))
            .await?;
        Ok(())
    }
}
