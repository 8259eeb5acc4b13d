//! Scripted [`HolderSource`] used by the monitor tests.

use std::{
    collections::VecDeque,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Mutex,
    },
    time::Duration,
};

use async_trait::async_trait;
use holder_watch_domain::Mint;

use crate::rpc::{FetchError, HolderSource};

pub(crate) struct ScriptedSource {
    calls: AtomicUsize,
    delay: Duration,
    replies: Mutex<VecDeque<Result<u64, FetchError>>>,
    fallback: Result<u64, FetchError>,
}

impl ScriptedSource {
    /// Answers `count` for every call.
    pub(crate) fn fixed(count: u64) -> Self {
        Self::scripted(Vec::new(), Ok(count))
    }

    /// Plays `replies` in order, then repeats `fallback`.
    pub(crate) fn scripted(
        replies: Vec<Result<u64, FetchError>>,
        fallback: Result<u64, FetchError>,
    ) -> Self {
        Self {
            calls: AtomicUsize::new(0),
            delay: Duration::ZERO,
            replies: Mutex::new(replies.into()),
            fallback,
        }
    }

    pub(crate) fn failing() -> Self {
        Self::scripted(Vec::new(), Err(transport_error()))
    }

    pub(crate) fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub(crate) fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

pub(crate) fn transport_error() -> FetchError {
    FetchError::Transport {
        attempts: 3,
        message: "connection refused".into(),
    }
}

#[async_trait]
impl HolderSource for ScriptedSource {
    async fn fetch_holder_count(&self, _mint: &Mint) -> Result<u64, FetchError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        let next = self.replies.lock().unwrap().pop_front();
        next.unwrap_or_else(|| self.fallback.clone())
    }

    async fn health_check(&self) -> Result<u64, FetchError> {
        Ok(1)
    }
}

pub(crate) fn wsol() -> Mint {
    Mint::parse("So11111111111111111111111111111111111111112").unwrap()
}

pub(crate) fn usdc() -> Mint {
    Mint::parse("EPjFWdd5AufqSSqeM2qN1xzybapC8G4wEGGkZwyTDt1v").unwrap()
}
