//! Participant directory.
//!
//! One canonical repository interface returning a typed optional
//! record; eligibility filters live at snapshot time, not in the
//! lookup path.

use crate::error::Result;
use crate::money::Money;
use crate::store::ParticipantKind;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Participant {
    pub id: String,
    pub kind: ParticipantKind,
    pub region_id: String,
    /// Referral-rank tier; 0 means no team rank.
    pub tier: u8,
    pub integral_score: u64,
    pub equity_score: u64,
    pub spend_total: Money,
    pub active: bool,
}

pub trait ParticipantDirectory: Send + Sync {
    fn find(&self, kind: ParticipantKind, id: &str) -> Result<Option<Participant>>;

    /// Active participants attached to a region. Weight filtering (spend
    /// minimums, zero scores) happens at snapshot time, not here.
    fn for_region(&self, region_id: &str) -> Result<Vec<Participant>>;
}

/// Sled-backed directory, keyed by `kind:id` with a region prefix index.
#[derive(Clone)]
pub struct SledDirectory {
    tree: sled::Tree,
}

const TREE_PARTICIPANTS: &str = "participants";

impl SledDirectory {
    pub fn open(db: &sled::Db) -> Result<Self> {
        Ok(Self {
            tree: db.open_tree(TREE_PARTICIPANTS)?,
        })
    }

    fn key(kind: ParticipantKind, id: &str) -> String {
        format!("{}:{}", kind, id)
    }

    pub fn upsert(&self, participant: &Participant) -> Result<()> {
        let key = Self::key(participant.kind, &participant.id);
        self.tree
            .insert(key.as_bytes(), crate::store::encode(participant)?)?;
        Ok(())
    }
}

impl ParticipantDirectory for SledDirectory {
    fn find(&self, kind: ParticipantKind, id: &str) -> Result<Option<Participant>> {
        match self.tree.get(Self::key(kind, id).as_bytes())? {
            Some(bytes) => Ok(Some(crate::store::decode(&bytes)?)),
            None => Ok(None),
        }
    }

    fn for_region(&self, region_id: &str) -> Result<Vec<Participant>> {
        let mut participants = Vec::new();
        for item in self.tree.iter() {
            let (_, value) = item?;
            let participant: Participant = crate::store::decode(&value)?;
            if participant.region_id == region_id && participant.active {
                participants.push(participant);
            }
        }
        // deterministic iteration order matters for residual assignment
        participants.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(participants)
    }
}
