use std::sync::atomic::{AtomicU64, Ordering};

/// Proof checking capability supplied per market.
///
/// An `Err` is treated like `Ok(false)`: the proof is rejected and the task
/// stays assigned.
pub trait ProofVerifier: Send + Sync {
    fn verify(&self, inputs: &[u8], proof: &[u8]) -> anyhow::Result<bool>;

    /// Screen public inputs at bid creation.
    fn verify_inputs(&self, _inputs: &[u8]) -> anyhow::Result<bool> {
        Ok(true)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VerifierMode {
    Accept,
    Reject,
    Fail,
}

/// Fixed-outcome verifier that counts calls.
#[derive(Debug)]
pub struct MockVerifier {
    mode: VerifierMode,
    reject_inputs: bool,
    calls: AtomicU64,
}

impl MockVerifier {
    pub fn new(mode: VerifierMode) -> Self {
        Self {
            mode,
            reject_inputs: false,
            calls: AtomicU64::new(0),
        }
    }

    pub fn accepting() -> Self {
        Self::new(VerifierMode::Accept)
    }

    pub fn rejecting() -> Self {
        Self::new(VerifierMode::Reject)
    }

    /// Reject every bid's inputs at creation.
    pub fn with_input_rejection(mut self) -> Self {
        self.reject_inputs = true;
        self
    }

    pub fn calls(&self) -> u64 {
        self.calls.load(Ordering::Relaxed)
    }
}

impl ProofVerifier for MockVerifier {
    fn verify(&self, _inputs: &[u8], proof: &[u8]) -> anyhow::Result<bool> {
        self.calls.fetch_add(1, Ordering::Relaxed);
        match self.mode {
            VerifierMode::Accept => Ok(!proof.is_empty()),
            VerifierMode::Reject => Ok(false),
            VerifierMode::Fail => anyhow::bail!("verifier backend unavailable"),
        }
    }

    fn verify_inputs(&self, inputs: &[u8]) -> anyhow::Result<bool> {
        Ok(!self.reject_inputs && !inputs.is_empty())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mock_modes() {
        let v = MockVerifier::accepting();
        assert!(v.verify(b"in", b"proof").unwrap());
        assert!(!v.verify(b"in", b"").unwrap());
        assert_eq!(v.calls(), 2);

        assert!(!MockVerifier::rejecting().verify(b"in", b"proof").unwrap());
        assert!(MockVerifier::new(VerifierMode::Fail).verify(b"in", b"p").is_err());
        assert!(!MockVerifier::accepting().with_input_rejection().verify_inputs(b"in").unwrap());
    }
}
