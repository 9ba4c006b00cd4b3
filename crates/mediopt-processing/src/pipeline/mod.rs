//! Streaming transform-and-upload pipeline.
//!
//! ```text
//! ByteSource ──Feed──► MediaTransform ──Encoded──► egress ──► Storage
//!      │                     │                       │
//!      └──────────── StageEvent ─────────────────────┴──► PipelineController ──► ResponseGate
//! ```
//!
//! Stages run as separate tasks joined by bounded channels, so a slow consumer
//! stalls its producer. Every stage reports to the controller through one event
//! channel; only the controller decides the outcome, and only through the gate.

pub mod controller;
pub mod egress;
pub mod gate;
pub mod source;
pub mod transform;

use std::fmt::{Display, Formatter, Result as FmtResult};

use bytes::Bytes;
use mediopt_core::PipelineError;

pub use controller::{
    PipelineController, PipelineHandle, PipelineReport, PipelineRequest, PipelineSettings,
    PipelineState, StageStates,
};
pub use egress::EgressReceipt;
pub use gate::ResponseGate;
pub use source::{ByteSource, IngestError, IngestEvent};
pub use transform::{
    ChunkSink, MediaTransform, TransformIo, TransformMonitor, TransformSummary,
};

/// Ingest to transform. A channel that closes without `End` means the input was
/// abandoned and must not be treated as complete.
#[derive(Debug, Clone, PartialEq)]
pub enum Feed {
    Data(Bytes),
    End,
}

/// Transform to egress. `End` carries what the transform learned about its output.
#[derive(Debug, Clone, PartialEq)]
pub enum Encoded {
    Data(Bytes),
    End(TransformSummary),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Stage {
    Ingest,
    Transform,
    Egress,
}

impl Display for Stage {
    fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
        let s = match self {
            Stage::Ingest => "ingest",
            Stage::Transform => "transform",
            Stage::Egress => "egress",
        };
        f.write_str(s)
    }
}

/// Everything a stage can tell the controller.
#[derive(Debug)]
pub(crate) enum StageEvent {
    /// Ingest forwarded the end-of-input marker.
    InputComplete { bytes: u64 },
    /// The caller went away before end of input.
    ClientClosed,
    Progress(u8),
    SubprocessSpawned(u32),
    TransformDone(TransformSummary),
    EgressDone(EgressReceipt),
    Failed(Stage, PipelineError),
    Canceled(Stage),
}
