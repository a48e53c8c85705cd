//! Outbound search queries and inbound results.

use crate::peer::PeerId;
use crate::time::LocalTime;
use crate::tth::Tth;

/// What kind of resource a search is looking for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SearchKind {
    /// Match any file or directory name.
    Any,
    /// Match only files.
    File,
    /// Match only directories.
    Directory,
    /// Match by exact Tiger-Tree-Hash.
    Tth,
}

impl Default for SearchKind {
    fn default() -> Self {
        Self::Any
    }
}

/// Caller-specified parameters for an outbound search.
#[derive(Debug, Clone, Default)]
pub struct SearchConf {
    /// What kind of resource to match.
    pub kind: SearchKind,
    /// Free-text query. Ignored when `kind` is `Tth`.
    pub query: String,
    /// Exact hash to match. Required when `kind` is `Tth`.
    pub tth: Option<Tth>,
    /// Only match resources at least this large.
    pub min_size: Option<u64>,
    /// Only match resources at most this large.
    pub max_size: Option<u64>,
    /// Only match files with this extension.
    pub extension: Option<String>,
}

/// A client-generated correlation token identifying one outbound search.
///
/// ADC carries this on the wire (`TO` field); NMDC has no correlation field,
/// so the token only exists locally to associate results delivered via the
/// most-recently-issued-search heuristic (see the hub session's serialized
/// NMDC search queue).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SearchToken(pub u32);

/// An outstanding outbound search.
#[derive(Debug, Clone)]
pub struct Search {
    /// The parameters this search was issued with.
    pub conf: SearchConf,
    /// Correlation token.
    pub token: SearchToken,
    /// When the search was issued; used to enforce the search lifetime window.
    pub issued_at: LocalTime,
}

/// One match returned for a search.
#[derive(Debug, Clone)]
pub struct SearchResult {
    /// The peer that responded.
    pub peer: PeerId,
    /// Virtual path of the matched resource.
    pub path: String,
    /// Size in bytes. Always 0 for NMDC directory results (not transported).
    pub size: u64,
    /// Tiger-Tree-Hash of the resource. Absent for directories.
    pub tth: Option<Tth>,
    /// Whether the matched resource is a directory.
    pub is_dir: bool,
    /// Free upload slots the responder reports.
    pub slots_avail: u32,
    /// Whether the responder is in active mode.
    pub is_active: bool,
}
