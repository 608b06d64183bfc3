#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SessionId(pub u128);

impl SessionId {
    pub const LEN: usize = 16;

    pub fn to_be_bytes(self) -> [u8; 16] {
        self.0.to_be_bytes()
    }

    pub fn from_be_bytes(b: [u8; 16]) -> Self {
        Self(u128::from_be_bytes(b))
    }

    pub fn short(self) -> u64 {
        // Folds the id to 64 bits for display; not collision-proof, but
        // player tags only need to be distinct among live sessions.
        (self.0 as u64) ^ ((self.0 >> 64) as u64)
    }

    /// The session-bound player id sent on the wire.
    pub fn player_tag(self) -> String {
        format!("{:016x}", self.short())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn player_tag_is_stable_and_short() {
        let a = SessionId(0x0102_0304_0506_0708_090a_0b0c_0d0e_0f10);
        assert_eq!(a.player_tag(), a.player_tag());
        assert_eq!(a.player_tag().len(), 16);
    }
}
