//! Provider selection by balance.
//!
//! Probes every configured provider in parallel, keeps those whose airtime
//! balance clears the per-service threshold, and ranks them richest-first.
//! A probe failure marks the provider unavailable instead of failing the
//! selection — one dead upstream must not stop the other from charging.

use std::sync::Arc;

use futures_util::future::join_all;
use tracing::{info, warn};

use rcg_schemas::ProviderBalance;

use crate::RechargeProvider;

#[derive(Clone)]
pub struct RankedProvider {
    pub provider: Arc<dyn RechargeProvider>,
    pub balance: f64,
}

#[derive(Debug)]
pub struct SelectionOutcome {
    /// Providers above threshold, balance descending.
    pub ranked: Vec<RankedProvider>,
    /// Every probe result, for diagnostics and the startup balance log.
    pub probed: Vec<ProviderBalance>,
}

impl std::fmt::Debug for RankedProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RankedProvider")
            .field("provider", &self.provider.name())
            .field("balance", &self.balance)
            .finish()
    }
}

#[derive(Debug, thiserror::Error)]
pub enum SelectorError {
    #[error("no provider above threshold {min_balance}")]
    NoProviderAboveThreshold {
        min_balance: f64,
        probed: Vec<ProviderBalance>,
    },
}

pub async fn select_providers(
    providers: &[Arc<dyn RechargeProvider>],
    min_balance: f64,
) -> Result<SelectionOutcome, SelectorError> {
    let probes = join_all(providers.iter().map(|p| {
        let p = Arc::clone(p);
        async move {
            let name = p.name();
            match p.balance().await {
                Ok(balance) => {
                    info!(provider = %name, balance, "balance probe");
                    (
                        p,
                        ProviderBalance {
                            name,
                            balance,
                            available: true,
                        },
                    )
                }
                Err(e) => {
                    warn!(provider = %name, error = %e, "balance probe failed");
                    (
                        p,
                        ProviderBalance {
                            name,
                            balance: 0.0,
                            available: false,
                        },
                    )
                }
            }
        }
    }))
    .await;

    let probed: Vec<ProviderBalance> = probes.iter().map(|(_, b)| b.clone()).collect();

    let mut ranked: Vec<RankedProvider> = probes
        .into_iter()
        .filter(|(_, b)| b.available && b.balance > min_balance)
        .map(|(provider, b)| RankedProvider {
            provider,
            balance: b.balance,
        })
        .collect();

    ranked.sort_by(|a, b| b.balance.total_cmp(&a.balance));

    if ranked.is_empty() {
        return Err(SelectorError::NoProviderAboveThreshold {
            min_balance,
            probed,
        });
    }

    Ok(SelectionOutcome { ranked, probed })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{ProviderError, RechargeRequest};
    use async_trait::async_trait;
    use rcg_schemas::{ProviderName, WebserviceCallResult};

    struct StubProvider {
        name: ProviderName,
        balance: Result<f64, ()>,
    }

    #[async_trait]
    impl RechargeProvider for StubProvider {
        fn name(&self) -> ProviderName {
            self.name
        }

        async fn balance(&self) -> Result<f64, ProviderError> {
            self.balance
                .map_err(|_| ProviderError::Credentials { provider: self.name })
        }

        async fn recharge(
            &self,
            _req: &RechargeRequest,
        ) -> Result<WebserviceCallResult, ProviderError> {
            unreachable!("selector never recharges")
        }
    }

    fn stub(name: ProviderName, balance: Result<f64, ()>) -> Arc<dyn RechargeProvider> {
        Arc::new(StubProvider { name, balance })
    }

    #[tokio::test]
    async fn ranks_by_balance_descending() {
        let providers = vec![
            stub(ProviderName::Taecel, Ok(150.0)),
            stub(ProviderName::Mst, Ok(900.0)),
        ];
        let out = select_providers(&providers, 100.0).await.unwrap();
        assert_eq!(out.ranked.len(), 2);
        assert_eq!(out.ranked[0].provider.name(), ProviderName::Mst);
        assert_eq!(out.ranked[1].provider.name(), ProviderName::Taecel);
    }

    #[tokio::test]
    async fn below_threshold_is_filtered() {
        let providers = vec![
            stub(ProviderName::Taecel, Ok(99.9)),
            stub(ProviderName::Mst, Ok(500.0)),
        ];
        let out = select_providers(&providers, 100.0).await.unwrap();
        assert_eq!(out.ranked.len(), 1);
        assert_eq!(out.ranked[0].provider.name(), ProviderName::Mst);
        // Diagnostics still show both probes.
        assert_eq!(out.probed.len(), 2);
    }

    #[tokio::test]
    async fn probe_failure_marks_unavailable() {
        let providers = vec![
            stub(ProviderName::Taecel, Err(())),
            stub(ProviderName::Mst, Ok(500.0)),
        ];
        let out = select_providers(&providers, 100.0).await.unwrap();
        assert_eq!(out.ranked.len(), 1);
        let taecel = out
            .probed
            .iter()
            .find(|b| b.name == ProviderName::Taecel)
            .unwrap();
        assert!(!taecel.available);
    }

    #[tokio::test]
    async fn all_below_threshold_errors_with_probes() {
        let providers = vec![
            stub(ProviderName::Taecel, Err(())),
            stub(ProviderName::Mst, Ok(50.0)),
        ];
        match select_providers(&providers, 100.0).await {
            Err(SelectorError::NoProviderAboveThreshold { probed, .. }) => {
                assert_eq!(probed.len(), 2);
            }
            Ok(_) => panic!("expected NoProviderAboveThreshold"),
        }
    }
}
