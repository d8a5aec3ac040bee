//! Conditional deposit address generation

use std::sync::Arc;
use tracing::info;

use crate::cda::{verify_cda_params, Cda, CdaInput, CdaParams};
use crate::error::Result;
use crate::persistence::{Persistence, Record};
use crate::signing::{Security, Signer};

use super::clock::Clock;

pub struct AddressGeneration {
    signer: Arc<dyn Signer>,
    store: Arc<Persistence>,
    clock: Arc<dyn Clock>,
    /// Used when the params do not name a security level
    security: Security,
}

impl AddressGeneration {
    pub fn new(
        signer: Arc<dyn Signer>,
        store: Arc<Persistence>,
        clock: Arc<dyn Clock>,
        security: Security,
    ) -> Self {
        Self {
            signer,
            store,
            clock,
            security,
        }
    }

    /// Derive a fresh address at the next key index and persist it as a CDA
    pub async fn generate_cda(&self, params: CdaParams) -> Result<Cda> {
        self.store.ready().await?;
        verify_cda_params(self.clock.now(), &params)?;

        let index = self.store.increment().await?;
        let security = params.security.unwrap_or(self.security);

        let input = CdaInput {
            address: self.signer.address(index, security),
            index,
            security,
            timeout_at: params.timeout_at,
            multi_use: params.multi_use,
            expected_amount: params.expected_amount.filter(|amount| *amount > 0),
            balance: None,
        };

        self.store.put(Record::Cda(input.clone())).await?;
        info!(
            "Generated CDA at index {} (timeout {}, multi-use {})",
            index, input.timeout_at, input.multi_use
        );

        Ok(input.to_cda())
    }
}
