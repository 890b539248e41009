//! Query pipeline: expression tree, translation, SQL generation, execution
//! and shaping.

mod context;
mod eval;
mod expression;
mod materializer;
mod select;
mod shaper;
mod sql;
mod translator;

pub use context::{AsyncQueryingStream, QueryContext, QueryingIter};
pub use eval::{compare_rows, evaluate, matches};
pub use expression::{
    member_chain, walk, BinaryOp, Expression, ExpressionRewriter, ExpressionVisitor,
    ParameterCollector, QuerySourceRef,
};
pub use materializer::{EntityInstance, EntityShaper, OwnedValue};
pub use select::{Ordering, SelectExpression};
pub use shaper::{
    AsyncQueryFn, DocumentQueryExpression, QueryCall, QueryShaperExpression, RowKind, SyncQueryFn,
};
pub use sql::{
    DocumentSqlGenerator, QuerySqlGenerator, RelationalSqlGenerator, SqlDialect, SqlParameter,
    SqlQuery,
};
pub use translator::{QueryTranslator, Queryable};
