//! TAECEL REST client.
//!
//! Form-encoded POSTs to three endpoints, credentials (`key` + `nip`) in the
//! body. A recharge is two calls: `RequestTXN` reserves the transaction and
//! returns a `transID`; `StatusTXN` confirms it and returns the folio plus
//! the human fields that end up in the detail text. Each HTTP call runs its
//! own retry ladder — the pair is never retried as a unit, because a
//! confirmed `RequestTXN` is money in flight.

use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;
use tracing::{debug, info};

use rcg_schemas::{ProviderName, WebserviceCallResult};

use crate::retry::{with_retry, RetryPolicy};
use crate::{ProviderError, RechargeProvider, RechargeRequest};

const P: ProviderName = ProviderName::Taecel;

pub struct TaecelClient {
    http: reqwest::Client,
    base_url: String,
    key: String,
    nip: String,
    timeout: Duration,
    retry: RetryPolicy,
}

#[derive(Debug, Deserialize)]
struct Envelope {
    success: bool,
    #[serde(default)]
    message: Option<String>,
    #[serde(default)]
    data: Option<Value>,
}

impl TaecelClient {
    pub fn new(
        base_url: impl Into<String>,
        key: impl Into<String>,
        nip: impl Into<String>,
        timeout: Duration,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url: base_url.into(),
            key: key.into(),
            nip: nip.into(),
            timeout,
            retry,
        }
    }

    fn endpoint(&self, name: &str) -> String {
        format!("{}/{}", self.base_url.trim_end_matches('/'), name)
    }

    /// One form POST, fully classified. 403 is terminal, ≥500 and transport
    /// failures are retryable, `success: false` is a domain rejection.
    async fn post_form(
        &self,
        name: &str,
        form: Vec<(&'static str, String)>,
    ) -> Result<Envelope, ProviderError> {
        let res = self
            .http
            .post(self.endpoint(name))
            .form(&form)
            .timeout(self.timeout)
            .send()
            .await
            .map_err(|e| ProviderError::from_http(P, e.status(), &e))?;

        let status = res.status();
        if status == reqwest::StatusCode::FORBIDDEN {
            return Err(ProviderError::Credentials { provider: P });
        }
        if status.is_server_error() {
            return Err(ProviderError::transport(P, format!("http {status}")));
        }
        if !status.is_success() {
            return Err(ProviderError::invalid(P, format!("http {status}")));
        }

        let env: Envelope = res
            .json()
            .await
            .map_err(|e| ProviderError::invalid(P, format!("body parse: {e}")))?;

        if !env.success {
            return Err(ProviderError::domain(
                P,
                env.message.unwrap_or_else(|| "unspecified failure".into()),
            ));
        }
        Ok(env)
    }

    fn credentials(&self) -> Vec<(&'static str, String)> {
        vec![("key", self.key.clone()), ("nip", self.nip.clone())]
    }

    async fn request_txn(&self, req: &RechargeRequest) -> Result<String, ProviderError> {
        let producto = req
            .codigo
            .clone()
            .unwrap_or_else(|| format!("TAE{:03}", req.amount));
        let env = with_retry(&self.retry, "taecel.RequestTXN", || {
            let mut form = self.credentials();
            form.push(("producto", producto.clone()));
            form.push(("referencia", req.sim.clone()));
            self.post_form("RequestTXN", form)
        })
        .await?;

        let data = env
            .data
            .ok_or_else(|| ProviderError::invalid(P, "RequestTXN without data"))?;
        str_field(&data, &["transID", "TransID"])
            .ok_or_else(|| ProviderError::invalid(P, "RequestTXN without transID"))
    }

    async fn status_txn(&self, trans_id: &str) -> Result<Value, ProviderError> {
        let env = with_retry(&self.retry, "taecel.StatusTXN", || {
            let mut form = self.credentials();
            form.push(("transID", trans_id.to_string()));
            self.post_form("StatusTXN", form)
        })
        .await?;

        env.data
            .ok_or_else(|| ProviderError::invalid(P, "StatusTXN without data"))
    }
}

#[async_trait]
impl RechargeProvider for TaecelClient {
    fn name(&self) -> ProviderName {
        P
    }

    async fn balance(&self) -> Result<f64, ProviderError> {
        let env = with_retry(&self.retry, "taecel.getBalance", || {
            self.post_form("getBalance", self.credentials())
        })
        .await?;

        let data = env
            .data
            .ok_or_else(|| ProviderError::invalid(P, "getBalance without data"))?;
        let bags = data
            .as_array()
            .ok_or_else(|| ProviderError::invalid(P, "getBalance data is not an array"))?;

        // Airtime lives in the "Tiempo Aire" bag; other bags (PINs, services)
        // are not spendable for recharges.
        let bag = bags
            .iter()
            .find(|b| str_field(b, &["Bolsa"]).as_deref() == Some("Tiempo Aire"))
            .ok_or_else(|| ProviderError::invalid(P, "no Tiempo Aire bag"))?;

        let saldo = str_field(bag, &["Saldo"])
            .ok_or_else(|| ProviderError::invalid(P, "bag without Saldo"))?;
        parse_money(&saldo).ok_or_else(|| ProviderError::invalid(P, format!("bad Saldo: {saldo}")))
    }

    async fn recharge(&self, req: &RechargeRequest) -> Result<WebserviceCallResult, ProviderError> {
        debug!(sim = %req.sim, amount = req.amount, "taecel RequestTXN");
        let trans_id = self.request_txn(req).await?;

        debug!(sim = %req.sim, trans_id = %trans_id, "taecel StatusTXN");
        let data = self.status_txn(&trans_id).await?;

        let folio = str_field(&data, &["Folio"])
            .ok_or_else(|| ProviderError::invalid(P, "StatusTXN without Folio"))?;
        let amount = str_field(&data, &["Monto"])
            .and_then(|m| parse_money(&m))
            .map(|m| m.round() as i64)
            .unwrap_or(req.amount);

        let result = WebserviceCallResult {
            success: true,
            provider: P,
            trans_id: str_field(&data, &["TransID"]).unwrap_or(trans_id),
            folio,
            amount,
            carrier: str_field(&data, &["Carrier"]).unwrap_or_default(),
            date_str: str_field(&data, &["Fecha"]).unwrap_or_default(),
            final_balance: str_field(&data, &["Saldo Final", "SaldoFinal"]).unwrap_or_default(),
            timeout: str_field(&data, &["Timeout"]).unwrap_or_default(),
            ip: str_field(&data, &["IP"]).unwrap_or_default(),
            note: str_field(&data, &["Nota"]).unwrap_or_default(),
            raw_response: data,
        };
        info!(
            sim = %req.sim,
            folio = %result.folio,
            amount = result.amount,
            "taecel recharge confirmed"
        );
        Ok(result)
    }
}

/// Read a field as a string whatever JSON scalar the upstream used.
fn str_field(v: &Value, keys: &[&str]) -> Option<String> {
    for k in keys {
        match v.get(k) {
            Some(Value::String(s)) => return Some(s.clone()),
            Some(Value::Number(n)) => return Some(n.to_string()),
            _ => {}
        }
    }
    None
}

/// `"10,000.00"` → 10000.0
fn parse_money(s: &str) -> Option<f64> {
    s.trim().replace(['$', ','], "").parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::retry::Strategy;
    use serde_json::json;
    use wiremock::matchers::{body_string_contains, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn client(server: &MockServer) -> TaecelClient {
        TaecelClient::new(
            server.uri(),
            "KEY123",
            "NIP456",
            Duration::from_secs(5),
            RetryPolicy {
                strategy: Strategy::Linear,
                base_delay_ms: 1,
                max_retries: 3,
            },
        )
    }

    #[test]
    fn money_parser_handles_separators() {
        assert_eq!(parse_money("10,000.00"), Some(10_000.0));
        assert_eq!(parse_money("$150.00"), Some(150.0));
        assert_eq!(parse_money("abc"), None);
    }

    #[tokio::test]
    async fn balance_reads_tiempo_aire_bag() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/getBalance"))
            .and(body_string_contains("key=KEY123"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "success": true,
                "message": "OK",
                "data": [
                    { "Bolsa": "Servicios", "Saldo": "1.00" },
                    { "Bolsa": "Tiempo Aire", "Saldo": "2,500.50" }
                ]
            })))
            .mount(&server)
            .await;

        let bal = client(&server).balance().await.unwrap();
        assert!((bal - 2_500.50).abs() < f64::EPSILON);
    }

    #[tokio::test]
    async fn recharge_runs_request_then_status() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/RequestTXN"))
            .and(body_string_contains("referencia=6681112222"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "success": true,
                "data": { "transID": "TX-77" }
            })))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/StatusTXN"))
            .and(body_string_contains("transID=TX-77"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "success": true,
                "data": {
                    "TransID": "TX-77",
                    "Folio": "F-001",
                    "Monto": "10.00",
                    "Carrier": "TELCEL",
                    "Fecha": "2026-01-15 12:00:00",
                    "Saldo Final": "2,490.50",
                    "Timeout": "30",
                    "IP": "10.0.0.1",
                    "Nota": ""
                }
            })))
            .expect(1)
            .mount(&server)
            .await;

        let req = RechargeRequest {
            sim: "6681112222".into(),
            amount: 10,
            codigo: Some("TAE010".into()),
            package: false,
        };
        let res = client(&server).recharge(&req).await.unwrap();
        assert!(res.success);
        assert_eq!(res.folio, "F-001");
        assert_eq!(res.trans_id, "TX-77");
        assert_eq!(res.amount, 10);
        assert_eq!(res.final_balance, "2,490.50");
    }

    #[tokio::test]
    async fn forbidden_is_terminal_and_not_retried() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/getBalance"))
            .respond_with(ResponseTemplate::new(403))
            .expect(1) // the ladder must not re-enter
            .mount(&server)
            .await;

        match client(&server).balance().await {
            Err(ProviderError::Credentials { .. }) => {}
            other => panic!("expected Credentials, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn http_500_retries_then_succeeds() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/getBalance"))
            .respond_with(ResponseTemplate::new(500))
            .up_to_n_times(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/getBalance"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "success": true,
                "data": [{ "Bolsa": "Tiempo Aire", "Saldo": "100.00" }]
            })))
            .mount(&server)
            .await;

        let bal = client(&server).balance().await.unwrap();
        assert!((bal - 100.0).abs() < f64::EPSILON);
    }

    #[tokio::test]
    async fn success_false_is_domain_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/RequestTXN"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "success": false,
                "message": "Producto no disponible"
            })))
            .expect(1)
            .mount(&server)
            .await;

        let req = RechargeRequest {
            sim: "6681112222".into(),
            amount: 10,
            codigo: None,
            package: false,
        };
        match client(&server).recharge(&req).await {
            Err(ProviderError::Domain { message, .. }) => {
                assert!(message.contains("Producto"));
            }
            other => panic!("expected Domain, got {other:?}"),
        }
    }
}
