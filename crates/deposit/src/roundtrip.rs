//! Fixed values of a deposit round trip: accounts, signer key, and the
//! funding and redemption transactions presented as proofs.

/// Account that opens, funds and redeems deposits.
pub const OPENER: &str = "0x1111111111111111111111111111111111111111";

pub const SIGNER_PUBKEY_X: &str =
    "0x4f355bdcb7cc0af728ef3cceb9615d90684bb5b2ca5f859ab0f0b704075871aa";
pub const SIGNER_PUBKEY_Y: &str =
    "0x385b6b1b8ead809ca67454d9683fcf2ba03456d6fe2c4abe2b07f0fbdbb2f1c1";

pub const FUNDING_TXID: &str =
    "0x7c48181cb5c030655eea651c5e9aa808983f646465cbe9d01c227d99cfbc405f";
/// Difficulty of the headers carried by the funding proof.
pub const FUNDING_DIFFICULTY: u64 = 6_353_030_562_983;

pub const REDEMPTION_TXID: &str =
    "0x39e9d2ec7fb6c4a1cbbe00d23d1b1a8ee1b5e1f6d96ee3ab4d0c9a0e8b3d7f21";
pub const REDEMPTION_OUTPUT_SCRIPT: &str = "0x160014f4eedc8f40d4b8e30771f792b065ebec0abaddef";
/// Bitcoin fee left to the signers when redeeming.
pub const REDEMPTION_FEE_SATOSHIS: u64 = 1_500;
