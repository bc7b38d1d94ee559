use serde::{Deserialize, Serialize};

use crate::derivation::Expr;
use crate::error::ConfigError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LoadMode {
    Insert,
    TruncateLoad,
    Upsert,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CheckpointStrategy {
    Auto,
    Key,
    Ordinal,
    None,
}

/// The strategy actually used at run time, after `CheckpointStrategy::Auto`
/// has been resolved against the presence of a checkpoint-column
/// (spec §4.6).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EffectiveCheckpointStrategy {
    Key,
    Ordinal,
    None,
}

impl CheckpointStrategy {
    pub fn resolve(self, checkpoint_column: &Option<String>) -> EffectiveCheckpointStrategy {
        match self {
            CheckpointStrategy::Key => EffectiveCheckpointStrategy::Key,
            CheckpointStrategy::Ordinal => EffectiveCheckpointStrategy::Ordinal,
            CheckpointStrategy::None => EffectiveCheckpointStrategy::None,
            CheckpointStrategy::Auto => {
                if checkpoint_column.is_some() {
                    EffectiveCheckpointStrategy::Key
                } else {
                    EffectiveCheckpointStrategy::Ordinal
                }
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TargetType {
    Integer,
    Decimal,
    TextBounded,
    Timestamp,
    Boolean,
    Binary,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AuditRole {
    CreatedBy,
    CreatedAt,
    UpdatedBy,
    UpdatedAt,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ColumnMapping {
    pub source_column: Option<String>,
    pub target_column: String,
    pub target_type: TargetType,
    pub key_flag: bool,
    pub key_sequence: Option<u32>,
    pub derivation_expression: Option<String>,
    pub required_flag: bool,
    pub audit_role: Option<AuditRole>,
    pub execution_sequence: u32,
}

impl ColumnMapping {
    pub fn is_audit(&self) -> bool {
        self.audit_role.is_some()
    }

    /// Parse `derivation_expression` once into an AST, if present. Cached by
    /// callers on the immutable in-memory `MappingDefinition` snapshot
    /// (spec §3: "captured into an immutable in-memory snapshot for the
    /// duration of the run").
    pub fn parsed_derivation(&self) -> Result<Option<Expr>, ConfigError> {
        match &self.derivation_expression {
            None => Ok(None),
            Some(src) => crate::derivation::parse(src)
                .map(Some)
                .map_err(|reason| ConfigError::InvalidDerivationExpression {
                    column: self.target_column.clone(),
                    reason,
                }),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MappingDefinition {
    pub mapping_reference: String,
    pub source_connection_ref: String,
    pub source_query: String,
    pub target_connection_ref: String,
    pub target_schema: String,
    pub target_table: String,
    pub column_list: Vec<ColumnMapping>,
    pub load_mode_default: LoadMode,
    pub checkpoint_strategy: CheckpointStrategy,
    pub checkpoint_column: Option<String>,
    pub batch_size: i64,
    pub truncate_flag: bool,
}

impl MappingDefinition {
    /// Validate every invariant named in spec §3/§9, returning a typed
    /// `ConfigError` enumerating the first rule violated rather than
    /// panicking or throwing (Design Notes §9: "exception-driven control
    /// flow... modeled as result values").
    pub fn validate(self) -> Result<Self, ConfigError> {
        if self.mapping_reference.trim().is_empty() {
            return Err(ConfigError::EmptyMappingReference);
        }

        if self.batch_size <= 0 {
            return Err(ConfigError::NonPositiveBatchSize(self.batch_size));
        }

        let effective = self.checkpoint_strategy.resolve(&self.checkpoint_column);
        if effective == EffectiveCheckpointStrategy::Key && self.checkpoint_column.is_none() {
            return Err(ConfigError::KeyStrategyMissingColumn);
        }
        if effective == EffectiveCheckpointStrategy::Ordinal && !query_has_order_by(&self.source_query) {
            return Err(ConfigError::OrdinalStrategyMissingOrderBy);
        }

        for col in &self.column_list {
            if col.source_column.is_none() && col.derivation_expression.is_none() {
                return Err(ConfigError::ColumnWithoutSource {
                    target_column: col.target_column.clone(),
                });
            }
            if let Some(expr) = &col.derivation_expression {
                crate::derivation::parse(expr).map_err(|reason| {
                    ConfigError::InvalidDerivationExpression {
                        column: col.target_column.clone(),
                        reason,
                    }
                })?;
            }
        }

        self.validate_audit_column_order()?;
        self.validate_key_sequence()?;

        Ok(self)
    }

    /// Invariant (spec §3): audit columns always appear after non-audit
    /// columns in the effective (execution_sequence) order.
    fn validate_audit_column_order(&self) -> Result<(), ConfigError> {
        let mut ordered: Vec<&ColumnMapping> = self.column_list.iter().collect();
        ordered.sort_by_key(|c| c.execution_sequence);

        let mut seen_audit = false;
        for col in ordered {
            if col.is_audit() {
                seen_audit = true;
            } else if seen_audit {
                return Err(ConfigError::AuditColumnOutOfOrder(col.target_column.clone()));
            }
        }
        Ok(())
    }

    fn validate_key_sequence(&self) -> Result<(), ConfigError> {
        let mut sequences: Vec<u32> = self
            .column_list
            .iter()
            .filter(|c| c.key_flag)
            .filter_map(|c| c.key_sequence)
            .collect();
        sequences.sort_unstable();
        for (idx, seq) in sequences.iter().enumerate() {
            if *seq != (idx as u32) + 1 {
                let offender = self
                    .column_list
                    .iter()
                    .find(|c| c.key_flag && c.key_sequence == Some(*seq))
                    .map(|c| c.target_column.clone())
                    .unwrap_or_default();
                return Err(ConfigError::InvalidKeySequence(offender));
            }
        }
        Ok(())
    }

    pub fn key_columns(&self) -> Vec<String> {
        let mut keyed: Vec<&ColumnMapping> = self.column_list.iter().filter(|c| c.key_flag).collect();
        keyed.sort_by_key(|c| c.key_sequence.unwrap_or(u32::MAX));
        keyed.into_iter().map(|c| c.target_column.clone()).collect()
    }

    pub fn effective_checkpoint_strategy(&self) -> EffectiveCheckpointStrategy {
        self.checkpoint_strategy.resolve(&self.checkpoint_column)
    }

    /// Columns in the order the Chunk Processor must evaluate and write
    /// them: by `execution_sequence`, which the audit-ordering invariant
    /// already guarantees places audit columns last.
    pub fn ordered_columns(&self) -> Vec<&ColumnMapping> {
        let mut cols: Vec<&ColumnMapping> = self.column_list.iter().collect();
        cols.sort_by_key(|c| c.execution_sequence);
        cols
    }

    /// Remove user-supplied audit columns cannot be removed (spec §3); this
    /// helper lets metadata authors union a user-supplied column list with
    /// the mandatory audit set without dropping the latter.
    pub fn with_required_audit_columns(mut self, required: Vec<ColumnMapping>) -> Self {
        for col in required {
            if !self
                .column_list
                .iter()
                .any(|c| c.audit_role == col.audit_role && col.audit_role.is_some())
            {
                self.column_list.push(col);
            }
        }
        self
    }
}

/// Best-effort ORDER BY detection on the *literal* SQL text. The planner
/// also requires this (spec §4.4) before it will append a stable tuple
/// ORDER BY of its own for ORDINAL chunking.
fn query_has_order_by(sql: &str) -> bool {
    let upper = sql.to_uppercase();
    upper.contains("ORDER BY")
}
