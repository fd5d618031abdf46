//! Recharge webservice clients.
//!
//! Two upstreams, one boundary: TAECEL (REST, form-encoded, two-step
//! RequestTXN → StatusTXN) and MST (SOAP, single-shot). Both are stateless
//! (every call carries full credentials) and both normalize into
//! [`rcg_schemas::WebserviceCallResult`] so nothing downstream knows which
//! provider charged the money.
//!
//! Error discipline matters more than usual here: every call that reaches the
//! upstream may cost money. Transport-level failures are retryable; an HTTP
//! 403 (credentials) or an MST `<Error>` payload (domain) is terminal and
//! must not be retried, since the provider has already said it will not
//! charge.

use async_trait::async_trait;

use rcg_schemas::{ProviderName, WebserviceCallResult};

mod error;
pub mod mst;
pub mod retry;
pub mod selector;
pub mod taecel;

pub use error::ProviderError;
pub use mst::MstClient;
pub use retry::RetryPolicy;
pub use selector::{select_providers, RankedProvider, SelectorError};
pub use taecel::TaecelClient;

/// One recharge to perform.
#[derive(Debug, Clone)]
pub struct RechargeRequest {
    pub sim: String,
    /// Whole pesos.
    pub amount: i64,
    /// Provider product code (TAECEL `producto`, MST PSL).
    pub codigo: Option<String>,
    /// VOZ package recharge — MST routes these through its `Paquetes`
    /// operation instead of `RecargaEWS`.
    pub package: bool,
}

/// Boundary every upstream implements. The pipeline only ever sees this
/// trait; the selector hands back trait objects ranked by balance.
#[async_trait]
pub trait RechargeProvider: Send + Sync {
    fn name(&self) -> ProviderName;

    /// Probe the airtime balance. Never charges.
    async fn balance(&self) -> Result<f64, ProviderError>;

    /// Perform one recharge. On `Ok`, money has been charged and the result
    /// carries the provider folio. On `Err(ProviderError::Domain(..))` the
    /// provider rejected the operation without charging.
    async fn recharge(&self, req: &RechargeRequest) -> Result<WebserviceCallResult, ProviderError>;
}
