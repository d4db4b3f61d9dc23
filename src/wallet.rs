//! Wallet adapter: a uniform `create_invoice` / `lookup_invoice` /
//! `verify_preimage` surface over either a hosted Lightning node or an
//! injected stub, built around an `Arc<Mutex<_>>`-wrapped backend handle
//! plus an in-process invoice cache.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use bitcoin_hashes::{hex::ToHex, sha256, Hash};
use rand::RngCore;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

/// Backend I/O envelope: a wallet call that hangs longer than this is
/// treated as a backend failure rather than blocking the request.
const BACKEND_TIMEOUT: Duration = Duration::from_secs(15);

#[derive(Debug, Error)]
pub enum WalletError {
    #[error("wallet backend error: {0}")]
    Backend(String),
    #[error("wallet backend returned no payment hash for the minted invoice")]
    MissingPaymentHash,
    #[error("invoice not found for payment hash {0}")]
    NotFound(String),
}

/// Wallet-internal invoice record.
#[derive(Debug, Clone)]
pub struct Invoice {
    pub payment_hash: String,
    pub bolt11: String,
    pub amount_sats: u64,
    pub description: String,
    pub created_at: u64,
    pub paid: bool,
    pub preimage: Option<String>,
}

/// The contract any backend (hosted node or stub) must satisfy to mint and
/// settle payment-gated invoices.
#[async_trait]
pub trait Wallet: Send + Sync {
    async fn create_invoice(&self, sats: u64, description: &str) -> Result<Invoice, WalletError>;
    async fn lookup_invoice(&self, payment_hash: &str) -> Result<Invoice, WalletError>;

    /// `SHA256(hex_decode(preimage)) == hex_decode(payment_hash)`, constant-time.
    fn verify_preimage(&self, preimage: &str, payment_hash: &str) -> bool {
        verify_preimage(preimage, payment_hash)
    }

    /// Releases any backend connection.
    async fn shutdown(&self);
}

/// `SHA256(hex_decode(preimage)) == hex_decode(payment_hash)`, constant-time.
pub fn verify_preimage(preimage: &str, payment_hash: &str) -> bool {
    let (Ok(preimage_bytes), Ok(hash_bytes)) = (hex::decode(preimage), hex::decode(payment_hash))
    else {
        return false;
    };
    let computed = sha256::Hash::hash(&preimage_bytes);
    crate::mac::signatures_equal(computed.to_hex().as_bytes(), hex::encode(hash_bytes).as_bytes())
}

/// Self-contained in-memory wallet used by tests and demos. Mints a random
/// preimage itself and considers every invoice paid as soon as the matching
/// preimage is presented to [`StubWallet::settle`] — a deterministic stand-in
/// for a real Lightning node confirming settlement.
#[derive(Default, Clone)]
pub struct StubWallet {
    invoices: Arc<Mutex<HashMap<String, Invoice>>>,
}

impl StubWallet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Marks the invoice for `payment_hash` paid with the given preimage, as
    /// a test/demo stand-in for the external wallet confirming settlement.
    pub async fn settle(&self, payment_hash: &str, preimage: &str) {
        let mut invoices = self.invoices.lock().await;
        if let Some(inv) = invoices.get_mut(payment_hash) {
            inv.paid = true;
            inv.preimage = Some(preimage.to_string());
        }
    }
}

#[async_trait]
impl Wallet for StubWallet {
    async fn create_invoice(&self, sats: u64, description: &str) -> Result<Invoice, WalletError> {
        let mut preimage_bytes = [0u8; 32];
        rand::thread_rng().fill_bytes(&mut preimage_bytes);
        let preimage = preimage_bytes.to_hex();
        let payment_hash = sha256::Hash::hash(&preimage_bytes).to_hex();

        let invoice = Invoice {
            payment_hash: payment_hash.clone(),
            bolt11: format!("lnbc{sats}stub1p{payment_hash}"),
            amount_sats: sats,
            description: description.to_string(),
            created_at: now_secs(),
            paid: false,
            preimage: Some(preimage),
        };
        debug!(payment_hash = %payment_hash, sats, "stub wallet minted invoice");
        self.invoices
            .lock()
            .await
            .insert(payment_hash.clone(), invoice.clone());
        Ok(invoice)
    }

    async fn lookup_invoice(&self, payment_hash: &str) -> Result<Invoice, WalletError> {
        self.invoices
            .lock()
            .await
            .get(payment_hash)
            .cloned()
            .ok_or_else(|| WalletError::NotFound(payment_hash.to_string()))
    }

    async fn shutdown(&self) {}
}

/// Adapter over a hosted Lightning node's REST interface. Issued invoices
/// are cached in-process keyed by `payment_hash`; a cache miss always falls
/// through to the backend rather than being treated as "unpaid".
pub struct HostedWallet {
    base_url: String,
    macaroon_hex: String,
    client: reqwest::Client,
    cache: Arc<Mutex<HashMap<String, Invoice>>>,
}

impl HostedWallet {
    pub fn new(base_url: impl Into<String>, macaroon_hex: impl Into<String>) -> Self {
        let client = reqwest::Client::builder()
            .timeout(BACKEND_TIMEOUT)
            .build()
            .expect("reqwest client always builds with a timeout");
        Self {
            base_url: base_url.into(),
            macaroon_hex: macaroon_hex.into(),
            client,
            cache: Arc::new(Mutex::new(HashMap::new())),
        }
    }
}

#[derive(serde::Deserialize)]
struct LndAddInvoiceResponse {
    payment_request: String,
    r_hash: String,
}

#[derive(serde::Deserialize)]
struct LndLookupInvoiceResponse {
    settled: bool,
    r_preimage: Option<String>,
}

#[async_trait]
impl Wallet for HostedWallet {
    async fn create_invoice(&self, sats: u64, description: &str) -> Result<Invoice, WalletError> {
        let resp = self
            .client
            .post(format!("{}/v1/invoices", self.base_url))
            .header("Grpc-Metadata-macaroon", &self.macaroon_hex)
            .json(&serde_json::json!({ "value": sats, "memo": description }))
            .send()
            .await
            .map_err(|e| WalletError::Backend(e.to_string()))?
            .error_for_status()
            .map_err(|e| WalletError::Backend(e.to_string()))?
            .json::<LndAddInvoiceResponse>()
            .await
            .map_err(|e| WalletError::Backend(e.to_string()))?;

        // The backend's own r_hash is the true payment hash. Falling back to
        // SHA256(bolt11) here would hash the invoice string instead of the
        // preimage's actual image, breaking preimage verification.
        if resp.r_hash.is_empty() {
            return Err(WalletError::MissingPaymentHash);
        }

        let invoice = Invoice {
            payment_hash: resp.r_hash.clone(),
            bolt11: resp.payment_request,
            amount_sats: sats,
            description: description.to_string(),
            created_at: now_secs(),
            paid: false,
            preimage: None,
        };
        info!(payment_hash = %resp.r_hash, sats, "hosted wallet minted invoice");
        self.cache.lock().await.insert(resp.r_hash, invoice.clone());
        Ok(invoice)
    }

    async fn lookup_invoice(&self, payment_hash: &str) -> Result<Invoice, WalletError> {
        let resp = self
            .client
            .get(format!("{}/v1/invoice/{payment_hash}", self.base_url))
            .header("Grpc-Metadata-macaroon", &self.macaroon_hex)
            .send()
            .await
            .map_err(|e| WalletError::Backend(e.to_string()))?
            .error_for_status()
            .map_err(|e| WalletError::Backend(e.to_string()))?
            .json::<LndLookupInvoiceResponse>()
            .await
            .map_err(|e| WalletError::Backend(e.to_string()))?;

        let mut cache = self.cache.lock().await;
        let invoice = cache
            .entry(payment_hash.to_string())
            .or_insert_with(|| Invoice {
                payment_hash: payment_hash.to_string(),
                bolt11: String::new(),
                amount_sats: 0,
                description: String::new(),
                created_at: now_secs(),
                paid: false,
                preimage: None,
            });
        invoice.paid = resp.settled;
        invoice.preimage = resp.r_preimage;
        Ok(invoice.clone())
    }

    async fn shutdown(&self) {
        warn!("hosted wallet adapter shut down, no further invoices will be minted");
    }
}

fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("system clock before epoch")
        .as_secs()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn stub_wallet_mints_a_self_consistent_invoice() {
        let wallet = StubWallet::new();
        let invoice = wallet.create_invoice(10, "test").await.unwrap();
        assert_eq!(invoice.amount_sats, 10);
        let preimage = invoice.preimage.clone().unwrap();
        assert!(wallet.verify_preimage(&preimage, &invoice.payment_hash));
    }

    #[tokio::test]
    async fn verify_preimage_rejects_wrong_hash() {
        let wallet = StubWallet::new();
        let invoice = wallet.create_invoice(10, "test").await.unwrap();
        assert!(!wallet.verify_preimage(&invoice.preimage.unwrap(), &"0".repeat(64)));
    }

    #[tokio::test]
    async fn lookup_invoice_reflects_settlement() {
        let wallet = StubWallet::new();
        let invoice = wallet.create_invoice(5, "test").await.unwrap();
        wallet
            .settle(&invoice.payment_hash, &invoice.preimage.clone().unwrap())
            .await;
        let looked_up = wallet.lookup_invoice(&invoice.payment_hash).await.unwrap();
        assert!(looked_up.paid);
    }

    #[tokio::test]
    async fn lookup_unknown_invoice_is_an_error() {
        let wallet = StubWallet::new();
        assert!(wallet.lookup_invoice("unknown").await.is_err());
    }

    #[test]
    fn verify_preimage_free_function_matches_sha256() {
        let preimage_bytes = [7u8; 32];
        let hash = sha256::Hash::hash(&preimage_bytes).to_hex();
        assert!(verify_preimage(&preimage_bytes.to_hex(), &hash));
        assert!(!verify_preimage(&preimage_bytes.to_hex(), &"0".repeat(64)));
    }
}
