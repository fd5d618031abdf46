//! MST SOAP client.
//!
//! Envelopes are built by templating; the interesting part is the response
//! shape: the SOAP body's `<...Result>` element carries an *escaped* XML
//! document as text, so parsing is two passes of quick-xml — unwrap the SOAP
//! layer, then parse the inner `<Respuesta>` payload.
//!
//! A payload containing `<Error>` is a domain rejection (no money charged),
//! never a transport error: the HTTP exchange succeeded, MST just said no.

use std::time::Duration;

use async_trait::async_trait;
use quick_xml::events::Event;
use quick_xml::Reader;
use serde_json::json;
use tracing::{debug, info};

use rcg_schemas::{ProviderName, WebserviceCallResult};

use crate::retry::{with_retry, RetryPolicy};
use crate::{ProviderError, RechargeProvider, RechargeRequest};

const P: ProviderName = ProviderName::Mst;
const SOAP_NS: &str = "http://tempuri.org/";

pub struct MstClient {
    http: reqwest::Client,
    url: String,
    usuario: String,
    clave: String,
    timeout: Duration,
    retry: RetryPolicy,
}

impl MstClient {
    pub fn new(
        url: impl Into<String>,
        usuario: impl Into<String>,
        clave: impl Into<String>,
        timeout: Duration,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            http: reqwest::Client::new(),
            url: url.into(),
            usuario: usuario.into(),
            clave: clave.into(),
            timeout,
            retry,
        }
    }

    fn recarga_payload(&self, body_fields: &[(&str, &str)]) -> String {
        let mut inner = String::from("<Recarga>");
        inner.push_str(&format!("<Usuario>{}</Usuario>", xml_escape(&self.usuario)));
        inner.push_str(&format!("<Clave>{}</Clave>", xml_escape(&self.clave)));
        for (tag, value) in body_fields {
            inner.push_str(&format!("<{tag}>{}</{tag}>", xml_escape(value)));
        }
        inner.push_str("</Recarga>");
        inner
    }

    /// POST one operation and return the unwrapped inner payload XML.
    async fn call(&self, operation: &str, payload: &str) -> Result<String, ProviderError> {
        let envelope = soap_envelope(operation, payload);
        let res = self
            .http
            .post(&self.url)
            .header("Content-Type", "text/xml; charset=utf-8")
            .header("SOAPAction", format!("\"{SOAP_NS}{operation}\""))
            .body(envelope)
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

        let body = res
            .text()
            .await
            .map_err(|e| ProviderError::transport(P, format!("body read: {e}")))?;

        soap_result_text(&body)
    }
}

#[async_trait]
impl RechargeProvider for MstClient {
    fn name(&self) -> ProviderName {
        P
    }

    async fn balance(&self) -> Result<f64, ProviderError> {
        let payload = self.recarga_payload(&[]);
        let inner = with_retry(&self.retry, "mst.ObtenSaldo", || {
            self.call("ObtenSaldo", &payload)
        })
        .await?;

        if let Some(err) = xml_text(&inner, "Error")? {
            return Err(ProviderError::domain(P, err));
        }
        let saldo = xml_text(&inner, "Saldo")?
            .ok_or_else(|| ProviderError::invalid(P, "ObtenSaldo without Saldo"))?;
        saldo
            .trim()
            .replace(',', "")
            .parse()
            .map_err(|_| ProviderError::invalid(P, format!("bad Saldo: {saldo}")))
    }

    async fn recharge(&self, req: &RechargeRequest) -> Result<WebserviceCallResult, ProviderError> {
        // VOZ packages go through Paquetes with the PSL code; everything else
        // is a single-amount RecargaEWS.
        let (operation, payload) = if req.package {
            let psl = req.codigo.clone().ok_or_else(|| {
                ProviderError::domain(P, format!("package recharge without PSL for {}", req.sim))
            })?;
            (
                "Paquetes",
                self.recarga_payload(&[("Telefono", req.sim.as_str()), ("PSL", psl.as_str())]),
            )
        } else {
            let monto = req.amount.to_string();
            (
                "RecargaEWS",
                self.recarga_payload(&[("Telefono", req.sim.as_str()), ("Monto", monto.as_str())]),
            )
        };

        debug!(sim = %req.sim, operation, "mst recharge");
        let inner = with_retry(&self.retry, "mst.recharge", || {
            self.call(operation, &payload)
        })
        .await?;

        if let Some(err) = xml_text(&inner, "Error")? {
            return Err(ProviderError::domain(P, err));
        }

        let folio = xml_text(&inner, "Folio")?
            .ok_or_else(|| ProviderError::invalid(P, "recharge response without Folio"))?;
        let amount = xml_text(&inner, "Cantidad")?
            .and_then(|c| c.trim().replace(',', "").parse::<f64>().ok())
            .map(|c| c.round() as i64)
            .unwrap_or(req.amount);

        let result = WebserviceCallResult {
            success: true,
            provider: P,
            trans_id: xml_text(&inner, "NumAut")?.unwrap_or_else(|| folio.clone()),
            folio,
            amount,
            carrier: xml_text(&inner, "Carrier")?.unwrap_or_default(),
            date_str: xml_text(&inner, "Fecha")?.unwrap_or_default(),
            final_balance: xml_text(&inner, "SaldoFinal")?.unwrap_or_default(),
            timeout: String::new(),
            ip: String::new(),
            note: xml_text(&inner, "Nota")?.unwrap_or_default(),
            raw_response: json!({ "payload": inner }),
        };
        info!(
            sim = %req.sim,
            folio = %result.folio,
            amount = result.amount,
            "mst recharge confirmed"
        );
        Ok(result)
    }
}

fn soap_envelope(operation: &str, inner_xml: &str) -> String {
    format!(
        concat!(
            r#"<?xml version="1.0" encoding="utf-8"?>"#,
            r#"<soap:Envelope xmlns:xsi="http://www.w3.org/2001/XMLSchema-instance" "#,
            r#"xmlns:xsd="http://www.w3.org/2001/XMLSchema" "#,
            r#"xmlns:soap="http://schemas.xmlsoap.org/soap/envelope/">"#,
            "<soap:Body><{op} xmlns=\"{ns}\"><sXML>{payload}</sXML></{op}></soap:Body>",
            "</soap:Envelope>"
        ),
        op = operation,
        ns = SOAP_NS,
        payload = xml_escape(inner_xml)
    )
}

fn xml_escape(s: &str) -> String {
    s.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
        .replace('\'', "&apos;")
}

/// Extract the text of the `<...Result>` element from a SOAP response body.
/// quick-xml unescapes the text event, which is exactly the unwrap the
/// nested-XML pattern needs.
pub fn soap_result_text(body: &str) -> Result<String, ProviderError> {
    let mut reader = Reader::from_str(body);
    reader.trim_text(true);
    let mut inside_result = false;

    loop {
        match reader.read_event() {
            Ok(Event::Start(e)) if e.local_name().as_ref().ends_with(b"Result") => {
                inside_result = true;
            }
            Ok(Event::Text(t)) if inside_result => {
                return t
                    .unescape()
                    .map(|c| c.into_owned())
                    .map_err(|e| ProviderError::invalid(P, format!("result unescape: {e}")));
            }
            Ok(Event::End(e)) if e.local_name().as_ref().ends_with(b"Result") => {
                // Empty result element.
                return Ok(String::new());
            }
            Ok(Event::Eof) => {
                return Err(ProviderError::invalid(P, "no Result element in SOAP body"))
            }
            Err(e) => return Err(ProviderError::invalid(P, format!("soap parse: {e}"))),
            _ => {}
        }
    }
}

/// First `<tag>text</tag>` in a payload, if present.
pub fn xml_text(xml: &str, tag: &str) -> Result<Option<String>, ProviderError> {
    let mut reader = Reader::from_str(xml);
    reader.trim_text(true);
    let mut inside = false;

    loop {
        match reader.read_event() {
            Ok(Event::Start(e)) if e.local_name().as_ref() == tag.as_bytes() => inside = true,
            Ok(Event::Text(t)) if inside => {
                return t
                    .unescape()
                    .map(|c| Some(c.into_owned()))
                    .map_err(|e| ProviderError::invalid(P, format!("xml unescape: {e}")));
            }
            Ok(Event::End(e)) if e.local_name().as_ref() == tag.as_bytes() => {
                return Ok(Some(String::new()));
            }
            Ok(Event::Eof) => return Ok(None),
            Err(e) => return Err(ProviderError::invalid(P, format!("xml parse: {e}"))),
            _ => {}
        }
    }
}
