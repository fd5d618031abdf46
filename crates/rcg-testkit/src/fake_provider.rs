//! Scripted recharge provider.
//!
//! Folios are handed out in sequence (or from a scripted list); per-sim
//! failures simulate domain rejections; the whole provider can be switched
//! into credentials-dead or transport-dead mode. Every recharge call is
//! recorded so tests can assert "zero webservice calls" precisely.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use serde_json::json;

use rcg_providers::{ProviderError, RechargeProvider, RechargeRequest};
use rcg_schemas::{ProviderName, WebserviceCallResult};

#[derive(Debug, Clone)]
pub enum FakeFailure {
    Credentials,
    Transport,
    Domain(String),
}

impl FakeFailure {
    fn to_error(&self, provider: ProviderName) -> ProviderError {
        match self {
            FakeFailure::Credentials => ProviderError::Credentials { provider },
            FakeFailure::Transport => ProviderError::Transport {
                provider,
                reason: "scripted transport failure".into(),
            },
            FakeFailure::Domain(msg) => ProviderError::Domain {
                provider,
                message: msg.clone(),
            },
        }
    }
}

struct FakeState {
    balance: Result<f64, FakeFailure>,
    scripted_folios: Vec<String>,
    folio_seq: u32,
    recharge_calls: Vec<(String, i64)>,
    fail_sims: HashMap<String, FakeFailure>,
    fail_all: Option<FakeFailure>,
}

pub struct FakeProvider {
    name: ProviderName,
    state: Mutex<FakeState>,
}

impl FakeProvider {
    pub fn new(name: ProviderName, balance: f64) -> Self {
        Self {
            name,
            state: Mutex::new(FakeState {
                balance: Ok(balance),
                scripted_folios: Vec::new(),
                folio_seq: 0,
                recharge_calls: Vec::new(),
                fail_sims: HashMap::new(),
                fail_all: None,
            }),
        }
    }

    pub fn with_folios(self, folios: &[&str]) -> Self {
        {
            let mut st = self.state.lock().unwrap();
            st.scripted_folios = folios.iter().rev().map(|s| s.to_string()).collect();
        }
        self
    }

    pub fn set_balance_failure(&self, failure: FakeFailure) {
        self.state.lock().unwrap().balance = Err(failure);
    }

    pub fn set_balance(&self, balance: f64) {
        self.state.lock().unwrap().balance = Ok(balance);
    }

    /// Every recharge fails with this (provider-level outage).
    pub fn fail_all_recharges(&self, failure: FakeFailure) {
        self.state.lock().unwrap().fail_all = Some(failure);
    }

    /// One sim fails (e.g. carrier rejection) while the rest succeed.
    pub fn fail_sim(&self, sim: &str, failure: FakeFailure) {
        self.state
            .lock()
            .unwrap()
            .fail_sims
            .insert(sim.to_string(), failure);
    }

    pub fn recharge_count(&self) -> usize {
        self.state.lock().unwrap().recharge_calls.len()
    }

    pub fn recharged_sims(&self) -> Vec<String> {
        self.state
            .lock()
            .unwrap()
            .recharge_calls
            .iter()
            .map(|(sim, _)| sim.clone())
            .collect()
    }
}

#[async_trait]
impl RechargeProvider for FakeProvider {
    fn name(&self) -> ProviderName {
        self.name
    }

    async fn balance(&self) -> Result<f64, ProviderError> {
        let st = self.state.lock().unwrap();
        st.balance
            .clone()
            .map_err(|f| f.to_error(self.name))
    }

    async fn recharge(&self, req: &RechargeRequest) -> Result<WebserviceCallResult, ProviderError> {
        let mut st = self.state.lock().unwrap();

        if let Some(f) = &st.fail_all {
            return Err(f.to_error(self.name));
        }
        if let Some(f) = st.fail_sims.get(&req.sim) {
            return Err(f.to_error(self.name));
        }

        st.recharge_calls.push((req.sim.clone(), req.amount));
        let folio = st.scripted_folios.pop().unwrap_or_else(|| {
            st.folio_seq += 1;
            format!("FAKE-{:04}", st.folio_seq)
        });

        Ok(WebserviceCallResult {
            success: true,
            provider: self.name,
            trans_id: format!("TX-{folio}"),
            folio,
            amount: req.amount,
            carrier: "TELCEL".into(),
            date_str: "2026-01-15 12:00:00".into(),
            final_balance: "1,000.00".into(),
            timeout: "30".into(),
            ip: "127.0.0.1".into(),
            note: String::new(),
            raw_response: json!({"fake": true}),
        })
    }
}
