use std::time::{Duration, Instant};

use serde::de::DeserializeOwned;
use serde::Serialize;
use tally_contracts::{
    BalanceSnapshot, CreditOutcome, CreditRequest, DebitOutcome, DebitRequest, ErrorResponse,
    ReconcileReport, TransactionPage,
};
use tally_kernel::{covers, DisplayTween, DEFAULT_TWEEN};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum LedgerError {
    #[error("transport error: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("server returned {status} ({code})")]
    Status { status: u16, code: String },
    #[error("contract parse error: {0}")]
    Contract(String),
    #[error("no owner bound to the session")]
    NoOwner,
}

/// HTTP client for the balance service. One method per route; read paths
/// surface errors, write-path policy (boolean failure, no retry) lives in
/// [`TokenSession`].
#[derive(Debug, Clone)]
pub struct LedgerClient {
    http: reqwest::Client,
    base_url: String,
}

impl LedgerClient {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self::with_http(reqwest::Client::new(), base_url)
    }

    pub fn with_http(http: reqwest::Client, base_url: impl Into<String>) -> Self {
        let base_url = base_url.into().trim_end_matches('/').to_string();
        Self { http, base_url }
    }

    pub async fn fetch_balance(&self, owner_id: &str) -> Result<BalanceSnapshot, LedgerError> {
        self.get_json(owner_id, "balance").await
    }

    pub async fn debit(
        &self,
        owner_id: &str,
        request: &DebitRequest,
    ) -> Result<DebitOutcome, LedgerError> {
        self.post_json(owner_id, "debit", request).await
    }

    pub async fn credit(
        &self,
        owner_id: &str,
        request: &CreditRequest,
    ) -> Result<CreditOutcome, LedgerError> {
        self.post_json(owner_id, "credit", request).await
    }

    pub async fn transactions(&self, owner_id: &str) -> Result<TransactionPage, LedgerError> {
        self.get_json(owner_id, "transactions").await
    }

    pub async fn reconcile(&self, owner_id: &str) -> Result<ReconcileReport, LedgerError> {
        self.get_json(owner_id, "reconcile").await
    }

    fn url(&self, owner_id: &str, tail: &str) -> String {
        format!("{}/v1/owners/{owner_id}/{tail}", self.base_url)
    }

    async fn get_json<T: DeserializeOwned>(
        &self,
        owner_id: &str,
        tail: &str,
    ) -> Result<T, LedgerError> {
        let response = self.http.get(self.url(owner_id, tail)).send().await?;
        decode(response).await
    }

    async fn post_json<B: Serialize, T: DeserializeOwned>(
        &self,
        owner_id: &str,
        tail: &str,
        body: &B,
    ) -> Result<T, LedgerError> {
        let response = self
            .http
            .post(self.url(owner_id, tail))
            .json(body)
            .send()
            .await?;
        decode(response).await
    }
}

async fn decode<T: DeserializeOwned>(response: reqwest::Response) -> Result<T, LedgerError> {
    let status = response.status();
    if !status.is_success() {
        let code = response
            .json::<ErrorResponse>()
            .await
            .map(|e| e.error.code)
            .unwrap_or_else(|_| "unknown".to_string());
        return Err(LedgerError::Status {
            status: status.as_u16(),
            code,
        });
    }
    response
        .json()
        .await
        .map_err(|e| LedgerError::Contract(e.to_string()))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionPhase {
    Uninitialized,
    Loading,
    Ready,
}

#[derive(Debug, Clone, Copy)]
struct ActiveTween {
    tween: DisplayTween,
    started: Instant,
}

/// Session-scoped view of one owner's balance. Holds the last authoritative
/// value fetched from the service and a purely cosmetic display tween; all
/// reads and writes go through the injected [`LedgerClient`].
pub struct TokenSession {
    client: LedgerClient,
    owner: Option<String>,
    phase: SessionPhase,
    balance: u64,
    active: Option<ActiveTween>,
    tween_duration: Duration,
}

impl TokenSession {
    pub fn new(client: LedgerClient) -> Self {
        Self {
            client,
            owner: None,
            phase: SessionPhase::Uninitialized,
            balance: 0,
            active: None,
            tween_duration: DEFAULT_TWEEN,
        }
    }

    pub fn with_tween_duration(mut self, duration: Duration) -> Self {
        self.tween_duration = duration;
        self
    }

    pub fn phase(&self) -> SessionPhase {
        self.phase
    }

    pub fn is_loading(&self) -> bool {
        self.phase == SessionPhase::Loading
    }

    /// Authoritative balance, available once the session is ready.
    pub fn balance(&self) -> Option<u64> {
        match self.phase {
            SessionPhase::Ready => Some(self.balance),
            _ => None,
        }
    }

    /// Binds the session to an owner (sign-in) or clears it (sign-out).
    /// Binding resets to `Loading` and re-fetches; on fetch failure the
    /// session stays in `Loading` so the caller can retry via [`refresh`].
    ///
    /// [`refresh`]: TokenSession::refresh
    pub async fn set_owner(&mut self, owner: Option<String>) -> Result<(), LedgerError> {
        self.active = None;
        self.balance = 0;
        match owner {
            None => {
                self.owner = None;
                self.phase = SessionPhase::Uninitialized;
                Ok(())
            }
            Some(owner) => {
                self.owner = Some(owner);
                self.phase = SessionPhase::Loading;
                self.refresh().await.map(|_| ())
            }
        }
    }

    /// Re-fetches the balance, discarding the cached value. Used after any
    /// operation that may have changed the balance out of band.
    pub async fn refresh(&mut self) -> Result<u64, LedgerError> {
        let owner = self.owner.clone().ok_or(LedgerError::NoOwner)?;
        let snapshot = self.client.fetch_balance(&owner).await?;
        self.adopt(snapshot.balance);
        Ok(snapshot.balance)
    }

    /// Spends `amount` tokens on `feature`. The cached balance is checked
    /// first so an obviously insufficient session never issues a request;
    /// the service re-checks atomically, so a stale cache only costs a
    /// round trip. Remote failures are reported as `false` and logged.
    pub async fn use_tokens(&mut self, amount: u64, feature: &str) -> bool {
        if self.phase != SessionPhase::Ready {
            tracing::warn!(feature, "token session is not ready; refusing debit");
            return false;
        }
        let Some(owner) = self.owner.clone() else {
            return false;
        };
        if !covers(self.balance, amount) {
            tracing::debug!(
                balance = self.balance,
                amount,
                feature,
                "cached balance cannot cover debit"
            );
            return false;
        }

        let request = DebitRequest {
            amount,
            feature: feature.to_string(),
            description: None,
        };
        match self.client.debit(&owner, &request).await {
            Ok(outcome) => {
                // The returned balance is authoritative whether or not the
                // debit applied.
                self.adopt(outcome.balance);
                outcome.applied
            }
            Err(err) => {
                tracing::warn!(error = %err, feature, "debit failed; treating as not applied");
                false
            }
        }
    }

    /// Starts the display tween from wherever the display currently is
    /// toward `target`. Cosmetic only; never touches the cached balance.
    pub fn animate_token_change(&mut self, target: u64) {
        let now = Instant::now();
        let from = self.display_value(now);
        self.active = Some(ActiveTween {
            tween: DisplayTween::new(from, target as f64, self.tween_duration),
            started: now,
        });
    }

    /// The user-facing balance at `now`: eases toward the authoritative
    /// value and equals it exactly once the tween duration has elapsed.
    pub fn display_value(&self, now: Instant) -> f64 {
        match &self.active {
            Some(active) => active
                .tween
                .value_at(now.saturating_duration_since(active.started)),
            None => self.balance as f64,
        }
    }

    fn adopt(&mut self, balance: u64) {
        self.animate_token_change(balance);
        self.phase = SessionPhase::Ready;
        self.balance = balance;
    }

    #[cfg(test)]
    fn ready_for_tests(client: LedgerClient, owner: &str, balance: u64) -> Self {
        let mut session = Self::new(client);
        session.owner = Some(owner.to_string());
        session.phase = SessionPhase::Ready;
        session.balance = balance;
        session
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GateOutcome {
    Unlocked { balance: u64 },
    Upsell { balance: u64, required: u64 },
    Failed,
}

/// The unlock protocol every paid surface follows: read the cached balance,
/// upsell when it cannot cover the cost, otherwise debit, and unlock only if
/// the debit applied. Call sites branch on the outcome instead of
/// re-implementing these steps.
pub async fn unlock_feature(session: &mut TokenSession, cost: u64, feature: &str) -> GateOutcome {
    let Some(balance) = session.balance() else {
        return GateOutcome::Failed;
    };
    if !covers(balance, cost) {
        return GateOutcome::Upsell {
            balance,
            required: cost,
        };
    }
    if session.use_tokens(cost, feature).await {
        GateOutcome::Unlocked {
            balance: session.balance().unwrap_or(0),
        }
    } else {
        GateOutcome::Failed
    }
}

/// Drives a tween one frame at a time, invoking `on_frame` with the current
/// display value until the tween settles. Convenience for embedders whose UI
/// loop is tokio-based; sampling [`TokenSession::display_value`] directly
/// works just as well.
pub async fn play_tween<F>(tween: DisplayTween, frame: Duration, mut on_frame: F)
where
    F: FnMut(f64),
{
    let started = Instant::now();
    loop {
        tokio::time::sleep(frame).await;
        let elapsed = started.elapsed();
        on_frame(tween.value_at(elapsed));
        if tween.finished(elapsed) {
            break;
        }
    }
}
