//! The scheduling core: partitions, queues, applications and nodes

pub mod cluster;
pub mod objects;
pub mod partition;
pub mod placement;
pub mod policies;
pub mod state;

pub use cluster::{
    AllocationRelease, AskReleaseRequest, AllocationReleaseRequest, ClusterContext,
    NewApplicationRequest, NewAskRequest, NewNodeRequest, RecoveredAllocationRequest,
    RejectedApplication, RejectedAsk, RejectedNode, RemoveApplicationRequest, RemoveNodeRequest,
    UpdateNodeRequest, UpdateResponse,
};
pub use objects::{
    Allocation, AllocationAsk, AllocationResult, Application, ApplicationState, Node,
    NodeReservation, Queue, Reservation, TerminationReason,
};
pub use partition::PartitionContext;
pub use placement::{PlacementManager, PlacementOutcome, PlacementRule, RuleKind};
pub use policies::{NodeIterator, NodeSortingPolicy, SortType};
pub use state::{ObjectEvent, ObjectState, StateMachine};
