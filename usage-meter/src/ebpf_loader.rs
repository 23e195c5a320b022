use aya::maps::{Array, MapData, MapError};
use aya::programs::ProgramError;
use aya::programs::tc::{self, SchedClassifier, SchedClassifierLinkId, TcAttachType};
use aya::{Ebpf, EbpfError, EbpfLoader, include_bytes_aligned};
use thiserror::Error;
use tracing::{debug, info, warn};

use usage_meter_common::{
    DROP_COUNTER_MAP, EGRESS_PROGRAM, EGRESS_USAGE_MAP, INGRESS_PROGRAM, INGRESS_USAGE_MAP,
};

use crate::drain::BpfCounterTable;
use crate::model::Direction;

const EBPF_BYTES: &[u8] = include_bytes_aligned!(concat!(env!("OUT_DIR"), "/usage-meter"));

#[derive(Debug, Error)]
pub enum AttachError {
    #[error("usage hooks are already attached to {0}")]
    AlreadyAttached(String),

    #[error("failed to load eBPF object")]
    Load(#[source] EbpfError),

    #[error("program {0} not found in eBPF object")]
    MissingProgram(&'static str),

    #[error("map {0} not found in eBPF object")]
    MissingMap(&'static str),

    #[error("map {map} has unexpected type")]
    MapType {
        map: &'static str,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to open map {map}")]
    Map {
        map: &'static str,
        #[source]
        source: MapError,
    },

    #[error("failed to {action} {program}")]
    Program {
        action: &'static str,
        program: &'static str,
        #[source]
        source: ProgramError,
    },
}

/// Kernel side of hook attachment: one program per traffic direction.
pub trait TrafficHooks {
    type Link;

    fn attach(&mut self, iface: &str, direction: Direction) -> Result<Self::Link, AttachError>;

    fn detach(&mut self, direction: Direction, link: Self::Link) -> Result<(), AttachError>;
}

/// The tc classifiers built from `usage-meter-ebpf`, loaded but not attached.
pub struct EbpfHooks {
    bpf: Ebpf,
}

impl EbpfHooks {
    pub fn load() -> Result<Self, AttachError> {
        let mut bpf = EbpfLoader::new()
            .load(EBPF_BYTES)
            .map_err(AttachError::Load)?;
        for program in [INGRESS_PROGRAM, EGRESS_PROGRAM] {
            classifier(&mut bpf, program)?
                .load()
                .map_err(|source| AttachError::Program {
                    action: "load",
                    program,
                    source,
                })?;
        }
        Ok(Self { bpf })
    }

    /// Hands the ingress and egress usage maps over to the drainer.
    pub fn take_tables(&mut self) -> Result<(BpfCounterTable, BpfCounterTable), AttachError> {
        let ingress = self.take_table(INGRESS_USAGE_MAP)?;
        let egress = self.take_table(EGRESS_USAGE_MAP)?;
        Ok((ingress, egress))
    }

    pub fn take_drop_counter(&mut self) -> Result<DropCounter, AttachError> {
        let map = DROP_COUNTER_MAP;
        let data = self
            .bpf
            .take_map(map)
            .ok_or(AttachError::MissingMap(map))?;
        let slots = Array::try_from(data).map_err(|source| AttachError::Map { map, source })?;
        Ok(DropCounter { slots })
    }

    fn take_table(&mut self, map: &'static str) -> Result<BpfCounterTable, AttachError> {
        let data = self
            .bpf
            .take_map(map)
            .ok_or(AttachError::MissingMap(map))?;
        BpfCounterTable::new(data).map_err(|source| AttachError::MapType { map, source })
    }
}

/// Frames the classifiers saw but could not account.
pub struct DropCounter {
    slots: Array<MapData, u64>,
}

impl DropCounter {
    pub fn read(&self) -> Result<u64, MapError> {
        self.slots.get(&0, 0)
    }
}

/// Turns the running drop total into increments between reports.
#[derive(Debug, Default)]
pub struct DropWatch {
    last: u64,
}

impl DropWatch {
    /// Returns the drops counted since the previous observation, if any.
    pub fn observe(&mut self, total: u64) -> Option<u64> {
        let fresh = total.saturating_sub(self.last);
        self.last = total;
        (fresh > 0).then_some(fresh)
    }
}

fn program_for(direction: Direction) -> (&'static str, TcAttachType) {
    match direction {
        Direction::Ingress => (INGRESS_PROGRAM, TcAttachType::Ingress),
        Direction::Egress => (EGRESS_PROGRAM, TcAttachType::Egress),
    }
}

fn classifier<'a>(
    bpf: &'a mut Ebpf,
    program: &'static str,
) -> Result<&'a mut SchedClassifier, AttachError> {
    bpf.program_mut(program)
        .ok_or(AttachError::MissingProgram(program))?
        .try_into()
        .map_err(|source| AttachError::Program {
            action: "resolve",
            program,
            source,
        })
}

impl TrafficHooks for EbpfHooks {
    type Link = SchedClassifierLinkId;

    fn attach(&mut self, iface: &str, direction: Direction) -> Result<Self::Link, AttachError> {
        // TCX-capable kernels ignore the qdisc; older ones need clsact present.
        if let Err(err) = tc::qdisc_add_clsact(iface) {
            debug!(iface, error = %err, "clsact qdisc not added");
        }
        let (program, attach_type) = program_for(direction);
        classifier(&mut self.bpf, program)?
            .attach(iface, attach_type)
            .map_err(|source| AttachError::Program {
                action: "attach",
                program,
                source,
            })
    }

    fn detach(&mut self, direction: Direction, link: Self::Link) -> Result<(), AttachError> {
        let (program, _) = program_for(direction);
        classifier(&mut self.bpf, program)?
            .detach(link)
            .map_err(|source| AttachError::Program {
                action: "detach",
                program,
                source,
            })
    }
}

struct Attachment<L> {
    iface: String,
    ingress: L,
    egress: L,
}

/// Keeps at most one ingress/egress hook pair attached.
pub struct AttachmentManager<H: TrafficHooks> {
    hooks: H,
    active: Option<Attachment<H::Link>>,
}

impl<H: TrafficHooks> AttachmentManager<H> {
    pub fn new(hooks: H) -> Self {
        Self {
            hooks,
            active: None,
        }
    }

    #[cfg(test)]
    pub fn attached_iface(&self) -> Option<&str> {
        self.active.as_ref().map(|a| a.iface.as_str())
    }

    /// Attaches both hooks to `iface`.
    ///
    /// Nothing stays attached when this fails: an ingress hook attached
    /// before a failing egress attach is detached again.
    pub fn attach(&mut self, iface: &str) -> Result<(), AttachError> {
        if let Some(active) = &self.active {
            return Err(AttachError::AlreadyAttached(active.iface.clone()));
        }

        let ingress = self.hooks.attach(iface, Direction::Ingress)?;
        let egress = match self.hooks.attach(iface, Direction::Egress) {
            Ok(link) => link,
            Err(err) => {
                if let Err(rollback) = self.hooks.detach(Direction::Ingress, ingress) {
                    warn!(iface, error = %rollback, "failed to roll back ingress hook");
                }
                return Err(err);
            }
        };

        info!(iface, "attached usage hooks");
        self.active = Some(Attachment {
            iface: iface.to_string(),
            ingress,
            egress,
        });
        Ok(())
    }

    /// Detaches both hooks. Both are attempted; the first failure is returned.
    pub fn detach(&mut self) -> Result<(), AttachError> {
        let Some(active) = self.active.take() else {
            return Ok(());
        };
        let egress = self.hooks.detach(Direction::Egress, active.egress);
        let ingress = self.hooks.detach(Direction::Ingress, active.ingress);
        info!(iface = %active.iface, "detached usage hooks");
        egress.and(ingress)
    }

    /// Detaches and releases the loaded programs.
    pub fn close(mut self) -> Result<(), AttachError> {
        self.detach()
    }
}
