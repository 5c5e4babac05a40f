/// Per-view request numbering. Only the latest issued number may write state.
#[derive(Debug, Default, Clone)]
pub struct RequestSequence {
    latest: u64,
}

impl RequestSequence {
    pub fn issue(&mut self) -> u64 {
        self.latest += 1;
        self.latest
    }

    pub fn is_current(&self, seq: u64) -> bool {
        seq == self.latest
    }

    pub fn latest(&self) -> u64 {
        self.latest
    }

    /// Invalidate everything issued so far without starting a request.
    pub fn invalidate(&mut self) {
        self.latest += 1;
    }
}
