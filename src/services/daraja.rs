use std::time::Duration;

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use chrono::Utc;
use rust_decimal::prelude::ToPrimitive;
use serde::{Deserialize, Serialize};
use tracing::{instrument, warn};
use utoipa::ToSchema;

use crate::config::DarajaConfig;
use crate::errors::ServiceError;
use crate::services::payments::{ChargeRequest, ChargeResponse, PaymentGateway, PaymentNotification};

/// Route the provider posts notifications back to.
pub const CALLBACK_PATH: &str = "/api/v1/payments/daraja/callback";

/// M-Pesa STK push client for the Safaricom Daraja API.
///
/// Every provider failure is logged with its detail and surfaced as a single
/// opaque `UpstreamError`; callers never see Daraja field names.
pub struct DarajaGateway {
    config: DarajaConfig,
    client: reqwest::Client,
}

impl DarajaGateway {
    pub fn new(config: DarajaConfig) -> Result<Self, ServiceError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| ServiceError::InternalError(format!("http client: {}", e)))?;
        Ok(Self { config, client })
    }

    async fn access_token(&self) -> Result<String, ServiceError> {
        let url = format!(
            "{}/oauth/v1/generate?grant_type=client_credentials",
            self.config.base_url
        );
        let response = self
            .client
            .get(&url)
            .basic_auth(&self.config.consumer_key, Some(&self.config.consumer_secret))
            .send()
            .await
            .map_err(|e| upstream("token request failed", &e.to_string()))?;

        if !response.status().is_success() {
            return Err(upstream("token request rejected", response.status().as_str()));
        }

        let token: TokenResponse = response
            .json()
            .await
            .map_err(|e| upstream("token response malformed", &e.to_string()))?;
        Ok(token.access_token)
    }
}

fn upstream(context: &str, detail: &str) -> ServiceError {
    warn!(context, detail, "Daraja call failed");
    ServiceError::UpstreamError("Payment initiation failed".to_string())
}

/// Normalizes a Kenyan MSISDN to the `254XXXXXXXXX` form Daraja requires.
/// Accepts `07XXXXXXXX`, `01XXXXXXXX`, `+2547...`, `2547...` and a bare
/// 9-digit subscriber number.
pub fn normalize_phone(raw: &str) -> Result<String, ServiceError> {
    let digits: String = raw.chars().filter(|c| c.is_ascii_digit()).collect();

    let msisdn = if digits.len() == 12 && digits.starts_with("254") {
        digits
    } else if digits.len() == 10 && digits.starts_with('0') {
        format!("254{}", &digits[1..])
    } else if digits.len() == 9 {
        format!("254{}", digits)
    } else {
        return Err(ServiceError::ValidationError(format!(
            "Invalid phone number: {}",
            raw
        )));
    };

    Ok(msisdn)
}

/// STK password: base64 of shortcode, passkey and timestamp concatenated.
fn stk_password(short_code: &str, passkey: &str, timestamp: &str) -> String {
    BASE64.encode(format!("{}{}{}", short_code, passkey, timestamp))
}

#[async_trait]
impl PaymentGateway for DarajaGateway {
    fn name(&self) -> &'static str {
        "daraja"
    }

    #[instrument(skip(self, request), fields(amount = %request.amount))]
    async fn initiate_charge(&self, request: &ChargeRequest) -> Result<ChargeResponse, ServiceError> {
        let phone = normalize_phone(&request.phone_number)?;
        let token = self.access_token().await?;

        let timestamp = Utc::now().format("%Y%m%d%H%M%S").to_string();
        let password = stk_password(&self.config.short_code, &self.config.passkey, &timestamp);

        // Daraja only accepts whole shillings.
        let amount = request
            .amount
            .round()
            .to_i64()
            .ok_or_else(|| ServiceError::ValidationError("Amount out of range".to_string()))?;

        let body = StkPushBody {
            business_short_code: self.config.short_code.clone(),
            password,
            timestamp,
            transaction_type: "CustomerPayBillOnline".to_string(),
            amount,
            party_a: phone.clone(),
            party_b: self.config.short_code.clone(),
            phone_number: phone,
            callback_url: format!(
                "{}{}",
                self.config.callback_base_url.trim_end_matches('/'),
                CALLBACK_PATH
            ),
            account_reference: request.account_reference.clone(),
            transaction_desc: request.description.clone(),
        };

        let url = format!("{}/mpesa/stkpush/v1/processrequest", self.config.base_url);
        let response = self
            .client
            .post(&url)
            .bearer_auth(token)
            .json(&body)
            .send()
            .await
            .map_err(|e| upstream("stk push request failed", &e.to_string()))?;

        if !response.status().is_success() {
            let status = response.status();
            let detail = response.text().await.unwrap_or_default();
            return Err(upstream(
                "stk push rejected",
                &format!("{}: {}", status, detail),
            ));
        }

        let reply: StkPushReply = response
            .json()
            .await
            .map_err(|e| upstream("stk push response malformed", &e.to_string()))?;

        if reply.response_code != "0" {
            return Err(upstream("stk push declined", &reply.response_description));
        }

        Ok(ChargeResponse {
            checkout_request_id: reply.checkout_request_id,
            merchant_request_id: reply.merchant_request_id,
            description: reply.response_description,
        })
    }
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
}

#[derive(Debug, Serialize)]
struct StkPushBody {
    #[serde(rename = "BusinessShortCode")]
    business_short_code: String,
    #[serde(rename = "Password")]
    password: String,
    #[serde(rename = "Timestamp")]
    timestamp: String,
    #[serde(rename = "TransactionType")]
    transaction_type: String,
    #[serde(rename = "Amount")]
    amount: i64,
    #[serde(rename = "PartyA")]
    party_a: String,
    #[serde(rename = "PartyB")]
    party_b: String,
    #[serde(rename = "PhoneNumber")]
    phone_number: String,
    #[serde(rename = "CallBackURL")]
    callback_url: String,
    #[serde(rename = "AccountReference")]
    account_reference: String,
    #[serde(rename = "TransactionDesc")]
    transaction_desc: String,
}

#[derive(Debug, Deserialize)]
struct StkPushReply {
    #[serde(rename = "MerchantRequestID")]
    merchant_request_id: String,
    #[serde(rename = "CheckoutRequestID")]
    checkout_request_id: String,
    #[serde(rename = "ResponseCode")]
    response_code: String,
    #[serde(rename = "ResponseDescription")]
    response_description: String,
}

/// Daraja notification envelope, as posted to the callback route.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct DarajaCallback {
    #[serde(rename = "Body")]
    pub body: CallbackBody,
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct CallbackBody {
    #[serde(rename = "stkCallback")]
    pub stk_callback: StkCallback,
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct StkCallback {
    #[serde(rename = "MerchantRequestID")]
    pub merchant_request_id: String,
    #[serde(rename = "CheckoutRequestID")]
    pub checkout_request_id: String,
    /// 0 means the charge went through.
    #[serde(rename = "ResultCode")]
    pub result_code: i64,
    #[serde(rename = "ResultDesc")]
    pub result_desc: String,
    #[serde(rename = "CallbackMetadata", default)]
    pub callback_metadata: Option<CallbackMetadata>,
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct CallbackMetadata {
    #[serde(rename = "Item", default)]
    pub items: Vec<MetadataItem>,
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct MetadataItem {
    #[serde(rename = "Name")]
    pub name: String,
    #[serde(rename = "Value", default)]
    pub value: Option<serde_json::Value>,
}

impl StkCallback {
    /// M-Pesa receipt number from the metadata, if the charge succeeded.
    pub fn receipt_number(&self) -> Option<String> {
        let items = &self.callback_metadata.as_ref()?.items;
        items
            .iter()
            .find(|item| item.name == "MpesaReceiptNumber")
            .and_then(|item| item.value.as_ref())
            .map(|value| match value {
                serde_json::Value::String(s) => s.clone(),
                other => other.to_string(),
            })
    }

    /// Strips provider field names off the envelope.
    pub fn into_notification(self) -> PaymentNotification {
        let receipt = self.receipt_number();
        PaymentNotification {
            external_txn_id: self.checkout_request_id,
            success: self.result_code == 0,
            receipt,
            description: self.result_desc,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use rust_decimal_macros::dec;
    use wiremock::matchers::{body_partial_json, header_exists, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[test]
    fn normalize_phone_accepts_common_forms() {
        assert_eq!(normalize_phone("0712345678").unwrap(), "254712345678");
        assert_eq!(normalize_phone("0112345678").unwrap(), "254112345678");
        assert_eq!(normalize_phone("712345678").unwrap(), "254712345678");
        assert_eq!(normalize_phone("254712345678").unwrap(), "254712345678");
        assert_eq!(normalize_phone("+254712345678").unwrap(), "254712345678");
        assert_eq!(normalize_phone("0712 345 678").unwrap(), "254712345678");
    }

    #[test]
    fn normalize_phone_rejects_garbage() {
        assert_matches!(normalize_phone(""), Err(ServiceError::ValidationError(_)));
        assert_matches!(normalize_phone("12345"), Err(ServiceError::ValidationError(_)));
        assert_matches!(
            normalize_phone("2547123456789999"),
            Err(ServiceError::ValidationError(_))
        );
    }

    #[test]
    fn stk_password_is_base64_of_concatenation() {
        let encoded = stk_password("174379", "secretpasskey", "20250825120000");
        let decoded = BASE64.decode(encoded).unwrap();
        assert_eq!(decoded, b"174379secretpasskey20250825120000");
    }

    #[test]
    fn callback_success_extracts_receipt() {
        let payload = serde_json::json!({
            "Body": {
                "stkCallback": {
                    "MerchantRequestID": "29115-34620561-1",
                    "CheckoutRequestID": "ws_CO_191220191020363925",
                    "ResultCode": 0,
                    "ResultDesc": "The service request is processed successfully.",
                    "CallbackMetadata": {
                        "Item": [
                            { "Name": "Amount", "Value": 1.0 },
                            { "Name": "MpesaReceiptNumber", "Value": "NLJ7RT61SV" },
                            { "Name": "PhoneNumber", "Value": 254712345678u64 }
                        ]
                    }
                }
            }
        });
        let envelope: DarajaCallback = serde_json::from_value(payload).unwrap();
        let notification = envelope.body.stk_callback.into_notification();
        assert!(notification.success);
        assert_eq!(notification.external_txn_id, "ws_CO_191220191020363925");
        assert_eq!(notification.receipt.as_deref(), Some("NLJ7RT61SV"));
    }

    #[test]
    fn callback_failure_has_no_receipt() {
        let payload = serde_json::json!({
            "Body": {
                "stkCallback": {
                    "MerchantRequestID": "29115-34620561-1",
                    "CheckoutRequestID": "ws_CO_191220191020363925",
                    "ResultCode": 1032,
                    "ResultDesc": "Request cancelled by user"
                }
            }
        });
        let envelope: DarajaCallback = serde_json::from_value(payload).unwrap();
        let notification = envelope.body.stk_callback.into_notification();
        assert!(!notification.success);
        assert!(notification.receipt.is_none());
    }

    fn test_config(base_url: String) -> DarajaConfig {
        DarajaConfig {
            consumer_key: "key".into(),
            consumer_secret: "secret".into(),
            short_code: "174379".into(),
            passkey: "passkey".into(),
            base_url,
            callback_base_url: "https://shop.example.com".into(),
            timeout_secs: 5,
        }
    }

    #[tokio::test]
    async fn initiate_charge_round_trip() {
        let server = MockServer::start().await;

        Mock::given(method("GET"))
            .and(path("/oauth/v1/generate"))
            .and(header_exists("authorization"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "access_token": "token-123",
                "expires_in": "3599"
            })))
            .expect(1)
            .mount(&server)
            .await;

        Mock::given(method("POST"))
            .and(path("/mpesa/stkpush/v1/processrequest"))
            .and(body_partial_json(serde_json::json!({
                "BusinessShortCode": "174379",
                "PhoneNumber": "254712345678",
                "Amount": 150,
                "CallBackURL": "https://shop.example.com/api/v1/payments/daraja/callback"
            })))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "MerchantRequestID": "29115-34620561-1",
                "CheckoutRequestID": "ws_CO_123",
                "ResponseCode": "0",
                "ResponseDescription": "Success. Request accepted for processing"
            })))
            .expect(1)
            .mount(&server)
            .await;

        let gateway = DarajaGateway::new(test_config(server.uri())).unwrap();
        let response = gateway
            .initiate_charge(&ChargeRequest {
                amount: dec!(150.00),
                phone_number: "0712345678".into(),
                account_reference: "ORDER-1".into(),
                description: "Order payment".into(),
            })
            .await
            .unwrap();

        assert_eq!(response.checkout_request_id, "ws_CO_123");
    }

    #[tokio::test]
    async fn initiate_charge_maps_decline_to_upstream_error() {
        let server = MockServer::start().await;

        Mock::given(method("GET"))
            .and(path("/oauth/v1/generate"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "access_token": "token-123"
            })))
            .mount(&server)
            .await;

        Mock::given(method("POST"))
            .and(path("/mpesa/stkpush/v1/processrequest"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "MerchantRequestID": "x",
                "CheckoutRequestID": "y",
                "ResponseCode": "1",
                "ResponseDescription": "Insufficient funds"
            })))
            .mount(&server)
            .await;

        let gateway = DarajaGateway::new(test_config(server.uri())).unwrap();
        let err = gateway
            .initiate_charge(&ChargeRequest {
                amount: dec!(10),
                phone_number: "0712345678".into(),
                account_reference: "ORDER-2".into(),
                description: "Order payment".into(),
            })
            .await
            .unwrap_err();

        assert_matches!(err, ServiceError::UpstreamError(_));
    }
}
