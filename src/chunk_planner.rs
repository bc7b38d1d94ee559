//! Chunk Planner (spec §4.4).
//!
//! Splits a source query into ordered, disjoint chunks using one of three
//! strategies. Grounded on `http_utils.rs::create_time_chunks`'s day-window
//! chunking loop, generalized from fixed-size date windows to
//! key-range/ordinal/none strategies over an arbitrary ordered bound.

use serde::{Deserialize, Serialize};

use crate::dialect::Dialect;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PlanStrategy {
    Key,
    Ordinal,
    None,
}

/// A checkpoint/chunk boundary value. KEY strategies carry an ordered
/// scalar (numeric or temporal, represented here as its canonical text
/// form so the planner stays agnostic to the underlying SQL type); ORDINAL
/// strategies carry a row-position integer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Bound {
    Key(String),
    Ordinal(i64),
    Unbounded,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChunkDescriptor {
    pub chunk_index: u64,
    pub lower_bound: Bound,
    pub upper_bound: Bound,
    pub strategy: PlanStrategy,
    /// The fully-built SQL text for this chunk (source query plus the
    /// planner-appended ORDER BY and the strategy-specific WHERE/OFFSET
    /// clause).
    pub sql: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChunkPlan {
    pub chunks: Vec<ChunkDescriptor>,
    pub strategy: PlanStrategy,
}

impl ChunkPlan {
    pub fn len(&self) -> usize {
        self.chunks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.chunks.is_empty()
    }
}

/// Inputs the planner needs to build a deterministic plan. `estimated_rows`
/// is either a cheap `COUNT` result or `None` when estimation is
/// unavailable (spec §4.4: "If estimation is unavailable, fall back to
/// ORDINAL").
pub struct PlanRequest<'a> {
    pub source_query: &'a str,
    pub strategy: PlanStrategy,
    pub batch_size: i64,
    pub checkpoint_column: Option<&'a str>,
    /// KEY-strategy resume point: the last committed checkpoint value, or
    /// `None` to start from scratch.
    pub key_checkpoint_start: Option<&'a str>,
    /// KEY-strategy max value of the checkpoint column currently in the
    /// source, used to bound the chunk loop.
    pub key_max_value: Option<i64>,
    /// ORDINAL-strategy resume point: cumulative rows already processed.
    pub ordinal_checkpoint_start: i64,
    /// ORDINAL-strategy total row count, when known, used to bound the
    /// chunk loop; `None` yields chunks until a final partial chunk.
    pub ordinal_total_rows: Option<i64>,
    pub estimated_rows: Option<i64>,
}

/// Build a deterministic `ChunkPlan` for a run, starting from the supplied
/// checkpoint. Two calls with identical inputs always produce an identical
/// plan (spec §3 ChunkPlan invariant).
pub fn plan_chunks(req: &PlanRequest<'_>, dialect: &dyn Dialect) -> ChunkPlan {
    match req.strategy {
        PlanStrategy::None => plan_none(req),
        PlanStrategy::Key => plan_key(req, dialect),
        PlanStrategy::Ordinal => plan_ordinal(req, dialect),
    }
}

fn append_order_by(sql: &str, column: &str) -> String {
    format!("{} ORDER BY {}", sql.trim_end_matches(';').trim_end(), column)
}

fn plan_none(req: &PlanRequest<'_>) -> ChunkPlan {
    ChunkPlan {
        chunks: vec![ChunkDescriptor {
            chunk_index: 0,
            lower_bound: Bound::Unbounded,
            upper_bound: Bound::Unbounded,
            strategy: PlanStrategy::None,
            sql: req.source_query.to_string(),
        }],
        strategy: PlanStrategy::None,
    }
}

fn plan_key(req: &PlanRequest<'_>, _dialect: &dyn Dialect) -> ChunkPlan {
    let column = req
        .checkpoint_column
        .expect("KEY strategy requires a checkpoint column (validated at enqueue time)");

    // Step sized so each chunk yields roughly `batch_size` rows; when the
    // caller has no row estimate, fall back to treating batch_size itself
    // as the key-range width (spec §4.4).
    let step = req.batch_size.max(1);

    let base_sql = append_order_by(req.source_query, column);

    let start: i64 = req
        .key_checkpoint_start
        .and_then(|s| s.parse::<i64>().ok())
        .unwrap_or(0);
    let max_value = req.key_max_value.unwrap_or(start);

    let mut chunks = Vec::new();
    let mut lower = start;
    let mut idx = 0u64;

    if max_value <= start {
        return ChunkPlan {
            chunks,
            strategy: PlanStrategy::Key,
        };
    }

    while lower < max_value {
        let upper = (lower + step).min(max_value);
        let sql = format!(
            "SELECT * FROM ({base_sql}) chunk_source WHERE {column} > {lower} AND {column} <= {upper}"
        );
        chunks.push(ChunkDescriptor {
            chunk_index: idx,
            lower_bound: Bound::Key(lower.to_string()),
            upper_bound: Bound::Key(upper.to_string()),
            strategy: PlanStrategy::Key,
            sql,
        });
        lower = upper;
        idx += 1;
    }

    ChunkPlan {
        chunks,
        strategy: PlanStrategy::Key,
    }
}

fn plan_ordinal(req: &PlanRequest<'_>, dialect: &dyn Dialect) -> ChunkPlan {
    let batch_size = req.batch_size.max(1);
    let mut chunks = Vec::new();
    let mut offset = req.ordinal_checkpoint_start;
    let mut idx = 0u64;

    match req.ordinal_total_rows {
        Some(total) => {
            while offset < total {
                let fetch = batch_size.min(total - offset);
                chunks.push(ordinal_descriptor(req, dialect, idx, offset, fetch));
                offset += fetch;
                idx += 1;
            }
        }
        None => {
            // Without a known total, the executor must stop issuing new
            // chunks once a chunk returns fewer rows than requested; the
            // planner still needs to emit at least the next window so the
            // executor has something to try.
            chunks.push(ordinal_descriptor(req, dialect, idx, offset, batch_size));
        }
    }

    ChunkPlan {
        chunks,
        strategy: PlanStrategy::Ordinal,
    }
}

fn ordinal_descriptor(
    req: &PlanRequest<'_>,
    dialect: &dyn Dialect,
    idx: u64,
    offset: i64,
    fetch: i64,
) -> ChunkDescriptor {
    let base_sql = req.source_query.trim_end_matches(';').trim_end();
    let sql = format!("{base_sql} {}", dialect.offset_fetch(offset, fetch));
    ChunkDescriptor {
        chunk_index: idx,
        lower_bound: Bound::Ordinal(offset),
        upper_bound: Bound::Ordinal(offset + fetch),
        strategy: PlanStrategy::Ordinal,
        sql,
    }
}

/// Property test helper / invariant check (spec §8 property 5): for any
/// plan, chunk row ranges must be pairwise disjoint in their declared
/// bounds.
pub fn assert_disjoint(plan: &ChunkPlan) -> bool {
    for (i, a) in plan.chunks.iter().enumerate() {
        for b in plan.chunks.iter().skip(i + 1) {
            if bounds_overlap(&a.lower_bound, &a.upper_bound, &b.lower_bound, &b.upper_bound) {
                return false;
            }
        }
    }
    true
}

fn bounds_overlap(a_lo: &Bound, a_hi: &Bound, b_lo: &Bound, b_hi: &Bound) -> bool {
    match (a_lo, a_hi, b_lo, b_hi) {
        (Bound::Ordinal(a1), Bound::Ordinal(a2), Bound::Ordinal(b1), Bound::Ordinal(b2)) => {
            a1 < b2 && b1 < a2
        }
        (Bound::Key(a1), Bound::Key(a2), Bound::Key(b1), Bound::Key(b2)) => {
            let (a1, a2, b1, b2): (i64, i64, i64, i64) = (
                a1.parse().unwrap_or(0),
                a2.parse().unwrap_or(0),
                b1.parse().unwrap_or(0),
                b2.parse().unwrap_or(0),
            );
            a1 < b2 && b1 < a2
        }
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dialect::Postgres;

    #[test]
    fn key_strategy_produces_expected_chunk_count_s1() {
        // S1: 3500 rows, txn_id in 1..3500, batch_size 1000 → 4 chunks.
        let req = PlanRequest {
            source_query: "SELECT * FROM txns",
            strategy: PlanStrategy::Key,
            batch_size: 1000,
            checkpoint_column: Some("txn_id"),
            key_checkpoint_start: None,
            key_max_value: Some(3500),
            ordinal_checkpoint_start: 0,
            ordinal_total_rows: None,
            estimated_rows: Some(3500),
        };
        let plan = plan_chunks(&req, &Postgres);
        assert_eq!(plan.len(), 4);
        assert_eq!(plan.chunks[0].lower_bound, Bound::Key("0".into()));
        assert_eq!(plan.chunks[0].upper_bound, Bound::Key("1000".into()));
        assert_eq!(plan.chunks[3].lower_bound, Bound::Key("3000".into()));
        assert_eq!(plan.chunks[3].upper_bound, Bound::Key("3500".into()));
        assert!(assert_disjoint(&plan));
    }

    #[test]
    fn key_strategy_resumes_from_checkpoint_s2() {
        // S2: resume from txn_id=2000, expect 2 chunks covering 2001..3500.
        let req = PlanRequest {
            source_query: "SELECT * FROM txns",
            strategy: PlanStrategy::Key,
            batch_size: 1000,
            checkpoint_column: Some("txn_id"),
            key_checkpoint_start: Some("2000"),
            key_max_value: Some(3500),
            ordinal_checkpoint_start: 0,
            ordinal_total_rows: None,
            estimated_rows: Some(1500),
        };
        let plan = plan_chunks(&req, &Postgres);
        assert_eq!(plan.len(), 2);
        assert_eq!(plan.chunks[0].lower_bound, Bound::Key("2000".into()));
        assert_eq!(plan.chunks[0].upper_bound, Bound::Key("3000".into()));
        assert_eq!(plan.chunks[1].upper_bound, Bound::Key("3500".into()));
    }

    #[test]
    fn ordinal_strategy_produces_expected_windows() {
        let req = PlanRequest {
            source_query: "SELECT * FROM t ORDER BY id",
            strategy: PlanStrategy::Ordinal,
            batch_size: 4,
            checkpoint_column: None,
            key_checkpoint_start: None,
            key_max_value: None,
            ordinal_checkpoint_start: 0,
            ordinal_total_rows: Some(10),
            estimated_rows: Some(10),
        };
        let plan = plan_chunks(&req, &Postgres);
        assert_eq!(plan.len(), 3);
        assert_eq!(plan.chunks[0].sql, "SELECT * FROM t ORDER BY id OFFSET 0 FETCH NEXT 4 ROWS ONLY");
        assert_eq!(plan.chunks[2].sql, "SELECT * FROM t ORDER BY id OFFSET 8 FETCH NEXT 2 ROWS ONLY");
        assert!(assert_disjoint(&plan));
    }

    #[test]
    fn none_strategy_is_one_synthetic_chunk() {
        let req = PlanRequest {
            source_query: "SELECT * FROM t",
            strategy: PlanStrategy::None,
            batch_size: 1000,
            checkpoint_column: None,
            key_checkpoint_start: None,
            key_max_value: None,
            ordinal_checkpoint_start: 0,
            ordinal_total_rows: None,
            estimated_rows: None,
        };
        let plan = plan_chunks(&req, &Postgres);
        assert_eq!(plan.len(), 1);
        assert_eq!(plan.chunks[0].sql, "SELECT * FROM t");
    }

    #[test]
    fn fully_caught_up_key_plan_is_empty() {
        let req = PlanRequest {
            source_query: "SELECT * FROM txns",
            strategy: PlanStrategy::Key,
            batch_size: 1000,
            checkpoint_column: Some("txn_id"),
            key_checkpoint_start: Some("3500"),
            key_max_value: Some(3500),
            ordinal_checkpoint_start: 0,
            ordinal_total_rows: None,
            estimated_rows: Some(0),
        };
        let plan = plan_chunks(&req, &Postgres);
        assert!(plan.is_empty());
    }
}
