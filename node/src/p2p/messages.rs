// node/src/p2p/messages.rs

use cancelchain_core::BlockMeta;
use serde::{Deserialize, Serialize};

/// `GET /head`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HeadInfo {
    pub height: u64,
    pub hash: String,
}

/// One entry of `GET /headers`: enough to walk a branch backwards.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HeaderSummary {
    pub height: u64,
    pub hash: String,
    pub prev_hash: String,
}

/// Query of `GET /blocks` and `GET /headers`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct RangeQuery {
    pub from_height: u64,
    pub count: u64,
}

/// Body returned by the POST endpoints.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubmitReply {
    pub status: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl From<&BlockMeta> for HeadInfo {
    fn from(meta: &BlockMeta) -> Self {
        HeadInfo {
            height: meta.height,
            hash: meta.hash.clone(),
        }
    }
}

impl From<&BlockMeta> for HeaderSummary {
    fn from(meta: &BlockMeta) -> Self {
        HeaderSummary {
            height: meta.height,
            hash: meta.hash.clone(),
            prev_hash: meta.prev_hash.clone(),
        }
    }
}
