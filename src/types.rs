use postgres_from_row::FromRow;
use postgres_types::FromSql;
use postgres_types::ToSql;
use rust_decimal::Decimal;
use std::fmt;
use time::OffsetDateTime;

pub type Id = i64;
pub type Height = i64;
pub type Nonce = i64;
pub type Timestamp = OffsetDateTime;
pub type Currency = String;
/// 20-byte address hash
pub type AddressHash = Vec<u8>;
/// 32-byte rollup chain identifier
pub type ChainID = Vec<u8>;

pub const ADDRESS_HASH_LENGTH: usize = 20;
pub const CHAIN_ID_LENGTH: usize = 32;

/// Native currency of the chain.
pub const NATIVE_CURRENCY: &str = "nria";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[derive(ToSql, FromSql)]
#[postgres(name = "tx_status")]
pub enum TxStatus {
    #[postgres(name = "success")]
    Success,
    #[postgres(name = "failed")]
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[derive(ToSql, FromSql)]
#[postgres(name = "action_type")]
pub enum ActionType {
    #[postgres(name = "sequence")]
    Sequence,
    #[postgres(name = "transfer")]
    Transfer,
    #[postgres(name = "validator_update")]
    ValidatorUpdate,
    #[postgres(name = "sudo_address_change")]
    SudoAddressChange,
    #[postgres(name = "ibc_relay")]
    IbcRelay,
    #[postgres(name = "ics20_withdrawal")]
    Ics20Withdrawal,
    #[postgres(name = "init_bridge_account")]
    InitBridgeAccount,
    #[postgres(name = "bridge_lock")]
    BridgeLock,
    #[postgres(name = "bridge_unlock")]
    BridgeUnlock,
    #[postgres(name = "fee_change")]
    FeeChange,
}

/// Genesis module a constant belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[derive(ToSql, FromSql)]
#[postgres(name = "module_name")]
pub enum ModuleName {
    #[postgres(name = "block")]
    Block,
    #[postgres(name = "evidence")]
    Evidence,
    #[postgres(name = "validator")]
    Validator,
    #[postgres(name = "version")]
    Version,
    #[postgres(name = "generic")]
    Generic,
}

impl ModuleName {
    pub fn as_str(&self) -> &'static str {
        match self {
            ModuleName::Block => "block",
            ModuleName::Evidence => "evidence",
            ModuleName::Validator => "validator",
            ModuleName::Version => "version",
            ModuleName::Generic => "generic",
        }
    }
}

impl fmt::Display for ModuleName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, FromRow)]
pub struct Block {
    pub id: Id,
    pub height: Height,
    pub time: Timestamp,
    pub hash: Vec<u8>,
    pub parent_hash: Vec<u8>,
    pub proposer_id: Id,
}

/// Block-level statistics, used to rewind chain totals on rollback.
#[derive(Debug, Clone, PartialEq, FromRow)]
pub struct BlockStats {
    pub id: Id,
    pub height: Height,
    pub time: Timestamp,
    pub tx_count: i64,
    /// Milliseconds since previous block
    pub block_time: i64,
    pub bytes_in_block: i64,
    pub data_size: i64,
    pub supply_change: Decimal,
}

#[derive(Debug, Clone, PartialEq, FromRow)]
pub struct Address {
    pub id: Id,
    /// Height at which the address was first spotted
    pub height: Height,
    pub hash: AddressHash,
    pub nonce: Nonce,
    pub actions_count: i64,
    pub signed_tx_count: i64,
}

impl Address {
    /// A blank candidate for given `hash` spotted at `height`.
    pub fn spotted(hash: AddressHash, height: Height) -> Self {
        Self {
            id: 0,
            height,
            hash,
            nonce: 0,
            actions_count: 0,
            signed_tx_count: 0,
        }
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", base16::encode_lower(&self.hash))
    }
}

#[derive(Debug, Clone, PartialEq, FromRow)]
pub struct Tx {
    pub id: Id,
    pub height: Height,
    pub time: Timestamp,
    /// Index of the tx within its block
    pub position: i64,
    pub actions_count: i64,
    pub status: TxStatus,
    pub error: Option<String>,
    pub hash: Vec<u8>,
    pub signer_id: Id,
    pub nonce: Nonce,
}

#[derive(Debug, Clone, PartialEq, FromRow)]
pub struct Action {
    pub id: Id,
    pub height: Height,
    pub time: Timestamp,
    /// Index of the action within its tx
    pub position: i64,
    pub action_type: ActionType,
    pub tx_id: Id,
    pub data: serde_json::Value,
}

#[derive(Debug, Clone, PartialEq, FromRow)]
pub struct Validator {
    pub id: Id,
    /// Height at which the validator was first seen
    pub height: Height,
    /// Upper case hex encoded consensus address
    pub address: String,
    pub pubkey_type: String,
    pub pubkey: Vec<u8>,
    pub power: Decimal,
}

#[derive(Debug, Clone, PartialEq, FromRow)]
pub struct Rollup {
    pub id: Id,
    pub chain_id: ChainID,
    pub first_height: Height,
    pub actions_count: i64,
    pub size: i64,
    pub bridge_address_id: Option<Id>,
}

impl Rollup {
    /// A blank candidate for given `chain_id` spotted at `height`.
    pub fn spotted(chain_id: ChainID, height: Height) -> Self {
        Self {
            id: 0,
            chain_id,
            first_height: height,
            actions_count: 0,
            size: 0,
            bridge_address_id: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, FromRow)]
pub struct RollupAction {
    pub rollup_id: Id,
    pub action_id: Id,
    pub tx_id: Id,
    pub height: Height,
    pub time: Timestamp,
    pub action_type: ActionType,
    /// Size of the rollup data carried by the action, in bytes
    pub size: i64,
}

#[derive(Debug, Clone, PartialEq, FromRow)]
pub struct RollupAddress {
    pub rollup_id: Id,
    pub address_id: Id,
    pub height: Height,
}

#[derive(Debug, Clone, PartialEq, FromRow)]
pub struct AddressAction {
    pub address_id: Id,
    pub action_id: Id,
    pub tx_id: Id,
    pub action_type: ActionType,
    pub height: Height,
    pub time: Timestamp,
}

#[derive(Debug, Clone, PartialEq, FromRow)]
pub struct BlockSignature {
    pub id: Id,
    pub validator_id: Id,
    pub height: Height,
    pub time: Timestamp,
}

/// Current balance of an address, keyed by address id and currency.
#[derive(Debug, Clone, PartialEq, FromRow)]
pub struct Balance {
    pub id: Id,
    pub currency: Currency,
    pub total: Decimal,
}

#[derive(Debug, Clone, PartialEq, FromRow)]
pub struct BalanceUpdate {
    pub id: Id,
    pub height: Height,
    pub address_id: Id,
    pub currency: Currency,
    pub delta: Decimal,
}

#[derive(Debug, Clone, PartialEq, FromRow)]
pub struct Constant {
    pub module: ModuleName,
    pub name: String,
    pub value: String,
}

impl Constant {
    pub fn new(module: ModuleName, name: &str, value: impl ToString) -> Self {
        Self {
            module,
            name: name.to_owned(),
            value: value.to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, FromRow)]
pub struct ChainState {
    pub id: Id,
    pub name: String,
    pub last_height: Height,
    pub last_hash: Vec<u8>,
    pub last_time: Timestamp,
    pub total_tx: i64,
    pub total_accounts: i64,
    pub total_rollups: i64,
    pub total_bytes: i64,
    pub total_supply: Decimal,
    /// Time of the state's first height, restored when every block is rolled back
    pub genesis_time: Timestamp,
}

impl ChainState {
    /// State of an indexer that has not included any block yet.
    pub fn initial(name: &str, height: Height, time: Timestamp) -> Self {
        Self {
            id: 0,
            name: name.to_owned(),
            last_height: height,
            last_hash: vec![],
            last_time: time,
            total_tx: 0,
            total_accounts: 0,
            total_rollups: 0,
            total_bytes: 0,
            total_supply: Decimal::ZERO,
            genesis_time: time,
        }
    }
}

#[cfg(feature = "test-utilities")]
pub mod testutils {
    use rand::distributions::Alphanumeric;
    use rand::Rng;
    use rust_decimal::Decimal;
    use time::OffsetDateTime;

    use super::*;

    /// Returns `n` random bytes.
    pub fn random_hash(n: usize) -> Vec<u8> {
        let mut rng = rand::thread_rng();
        (0..n).map(|_| rng.gen()).collect()
    }

    /// Returns a random upper case hex validator address.
    pub fn random_validator_address() -> String {
        base16::encode_upper(&random_hash(ADDRESS_HASH_LENGTH))
    }

    /// Returns a random lower case currency denomination.
    pub fn random_currency() -> String {
        rand::thread_rng()
            .sample_iter(&Alphanumeric)
            .take(8)
            .map(|c| char::from(c).to_ascii_lowercase())
            .collect()
    }

    /// Fixed timestamp for a given height, 2 seconds apart.
    pub fn time_at(height: Height) -> Timestamp {
        OffsetDateTime::from_unix_timestamp(1_700_000_000 + 2 * height)
            .expect("timestamp within range")
    }

    impl Block {
        pub fn dummy() -> Self {
            Self {
                id: 0,
                height: 1,
                time: time_at(1),
                hash: random_hash(32),
                parent_hash: random_hash(32),
                proposer_id: 0,
            }
        }

        pub fn height(&self, height: Height) -> Self {
            Self {
                height,
                time: time_at(height),
                ..self.clone()
            }
        }

        pub fn proposer_id(&self, proposer_id: Id) -> Self {
            Self {
                proposer_id,
                ..self.clone()
            }
        }
    }

    impl BlockStats {
        pub fn dummy() -> Self {
            Self {
                id: 0,
                height: 1,
                time: time_at(1),
                tx_count: 0,
                block_time: 2000,
                bytes_in_block: 0,
                data_size: 0,
                supply_change: Decimal::ZERO,
            }
        }

        pub fn height(&self, height: Height) -> Self {
            Self {
                height,
                time: time_at(height),
                ..self.clone()
            }
        }

        pub fn tx_count(&self, tx_count: i64) -> Self {
            Self {
                tx_count,
                ..self.clone()
            }
        }

        pub fn bytes_in_block(&self, bytes_in_block: i64) -> Self {
            Self {
                bytes_in_block,
                ..self.clone()
            }
        }

        pub fn supply_change(&self, supply_change: Decimal) -> Self {
            Self {
                supply_change,
                ..self.clone()
            }
        }
    }

    impl Address {
        pub fn dummy() -> Self {
            Self::spotted(random_hash(ADDRESS_HASH_LENGTH), 1)
        }

        pub fn height(&self, height: Height) -> Self {
            Self {
                height,
                ..self.clone()
            }
        }

        pub fn hash(&self, hash: &[u8]) -> Self {
            Self {
                hash: hash.to_vec(),
                ..self.clone()
            }
        }

        pub fn counts(&self, actions_count: i64, signed_tx_count: i64) -> Self {
            Self {
                actions_count,
                signed_tx_count,
                ..self.clone()
            }
        }
    }

    impl Tx {
        pub fn dummy() -> Self {
            Self {
                id: 0,
                height: 1,
                time: time_at(1),
                position: 0,
                actions_count: 0,
                status: TxStatus::Success,
                error: None,
                hash: random_hash(32),
                signer_id: 0,
                nonce: 0,
            }
        }

        pub fn height(&self, height: Height) -> Self {
            Self {
                height,
                time: time_at(height),
                ..self.clone()
            }
        }

        pub fn position(&self, position: i64) -> Self {
            Self {
                position,
                ..self.clone()
            }
        }

        pub fn signer_id(&self, signer_id: Id) -> Self {
            Self {
                signer_id,
                ..self.clone()
            }
        }

        pub fn nonce(&self, nonce: Nonce) -> Self {
            Self {
                nonce,
                ..self.clone()
            }
        }

        pub fn actions_count(&self, actions_count: i64) -> Self {
            Self {
                actions_count,
                ..self.clone()
            }
        }
    }

    impl Action {
        pub fn dummy() -> Self {
            Self {
                id: 0,
                height: 1,
                time: time_at(1),
                position: 0,
                action_type: ActionType::Sequence,
                tx_id: 0,
                data: serde_json::json!({}),
            }
        }

        pub fn height(&self, height: Height) -> Self {
            Self {
                height,
                time: time_at(height),
                ..self.clone()
            }
        }

        pub fn position(&self, position: i64) -> Self {
            Self {
                position,
                ..self.clone()
            }
        }

        pub fn action_type(&self, action_type: ActionType) -> Self {
            Self {
                action_type,
                ..self.clone()
            }
        }

        pub fn tx_id(&self, tx_id: Id) -> Self {
            Self {
                tx_id,
                ..self.clone()
            }
        }

        pub fn data(&self, data: serde_json::Value) -> Self {
            Self {
                data,
                ..self.clone()
            }
        }
    }

    impl Validator {
        pub fn dummy() -> Self {
            let pubkey = random_hash(32);
            Self {
                id: 0,
                height: 0,
                address: base16::encode_upper(&pubkey[..ADDRESS_HASH_LENGTH]),
                pubkey_type: String::from("tendermint/PubKeyEd25519"),
                pubkey,
                power: Decimal::ONE,
            }
        }

        pub fn height(&self, height: Height) -> Self {
            Self {
                height,
                ..self.clone()
            }
        }

        pub fn address(&self, address: &str) -> Self {
            Self {
                address: address.to_owned(),
                ..self.clone()
            }
        }
    }

    impl Rollup {
        pub fn dummy() -> Self {
            Self::spotted(random_hash(CHAIN_ID_LENGTH), 1)
        }

        pub fn first_height(&self, first_height: Height) -> Self {
            Self {
                first_height,
                ..self.clone()
            }
        }

        pub fn chain_id(&self, chain_id: &[u8]) -> Self {
            Self {
                chain_id: chain_id.to_vec(),
                ..self.clone()
            }
        }

        pub fn totals(&self, actions_count: i64, size: i64) -> Self {
            Self {
                actions_count,
                size,
                ..self.clone()
            }
        }

        pub fn bridge_address_id(&self, bridge_address_id: Id) -> Self {
            Self {
                bridge_address_id: Some(bridge_address_id),
                ..self.clone()
            }
        }
    }

    impl BlockSignature {
        pub fn new(validator_id: Id, height: Height) -> Self {
            Self {
                id: 0,
                validator_id,
                height,
                time: time_at(height),
            }
        }
    }

    impl BalanceUpdate {
        pub fn new(address_id: Id, height: Height, delta: Decimal) -> Self {
            Self {
                id: 0,
                height,
                address_id,
                currency: String::from(NATIVE_CURRENCY),
                delta,
            }
        }
    }

    impl Balance {
        pub fn native(id: Id, total: Decimal) -> Self {
            Self {
                id,
                currency: String::from(NATIVE_CURRENCY),
                total,
            }
        }
    }
}
