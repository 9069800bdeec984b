//! HTTP client for the hosted payment gateway.
//!
//! The gateway speaks a Razorpay-compatible REST API: orders are created and
//! fetched under `/orders` with basic auth over the key pair. Amounts are
//! minor currency units throughout.

use std::env;

use async_trait::async_trait;
use lingua_common::{GatewayError, GatewayOrder, GatewayOrderRequest, PaymentGateway};

const GATEWAY_URL_ENV: &str = "LINGUA_GATEWAY_URL";
const DEFAULT_GATEWAY_URL: &str = "https://api.razorpay.com/v1";
const GATEWAY_KEY_ID_ENV: &str = "LINGUA_GATEWAY_KEY_ID";
const GATEWAY_KEY_SECRET_ENV: &str = "LINGUA_GATEWAY_KEY_SECRET";

pub struct RestGateway {
    http: reqwest::Client,
    base_url: String,
    key_id: String,
    key_secret: String,
}

impl RestGateway {
    pub fn new(
        base_url: impl Into<String>,
        key_id: impl Into<String>,
        key_secret: impl Into<String>,
    ) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url: base_url.into(),
            key_id: key_id.into(),
            key_secret: key_secret.into(),
        }
    }

    pub fn from_env() -> Self {
        let base_url =
            env::var(GATEWAY_URL_ENV).unwrap_or_else(|_| DEFAULT_GATEWAY_URL.to_string());
        let key_id = env::var(GATEWAY_KEY_ID_ENV)
            .unwrap_or_else(|_| panic!("{} must be set", GATEWAY_KEY_ID_ENV));
        let key_secret = env::var(GATEWAY_KEY_SECRET_ENV)
            .unwrap_or_else(|_| panic!("{} must be set", GATEWAY_KEY_SECRET_ENV));
        Self::new(base_url, key_id, key_secret)
    }

    async fn decode_order(&self, resp: reqwest::Response) -> Result<GatewayOrder, GatewayError> {
        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(GatewayError::Status {
                status: status.as_u16(),
                body,
            });
        }
        resp.json::<GatewayOrder>()
            .await
            .map_err(|err| GatewayError::Decode(err.to_string()))
    }
}

#[async_trait]
impl PaymentGateway for RestGateway {
    async fn create_order(&self, req: &GatewayOrderRequest) -> Result<GatewayOrder, GatewayError> {
        let resp = self
            .http
            .post(format!("{}/orders", self.base_url))
            .basic_auth(&self.key_id, Some(&self.key_secret))
            .json(req)
            .send()
            .await
            .map_err(|err| GatewayError::Request(err.to_string()))?;
        self.decode_order(resp).await
    }

    async fn fetch_order(&self, order_id: &str) -> Result<GatewayOrder, GatewayError> {
        let resp = self
            .http
            .get(format!("{}/orders/{}", self.base_url, order_id))
            .basic_auth(&self.key_id, Some(&self.key_secret))
            .send()
            .await
            .map_err(|err| GatewayError::Request(err.to_string()))?;
        self.decode_order(resp).await
    }

    fn key_id(&self) -> &str {
        &self.key_id
    }
}
