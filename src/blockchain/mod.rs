pub mod bridge;
pub mod ethereum;
pub mod network;
pub mod traits;

pub use bridge::{BridgeTxn, BridgeTxnStatus, BridgeTxnType, WithdrawalPhase};
pub use network::{NetworkDetail, NetworkRegistry};
pub use traits::{ChainProvider, MessageStateSource, ProviderFactory, RewardClaimer};
