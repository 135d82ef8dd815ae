pub mod derived;
pub mod state;

pub use state::{
    BasicCounterState, CounterState, HasBasic, HasUncore, ServerUncoreCounterState,
    SocketCounterState, SystemCounterState, UncoreCounterState, UnitCounters, UnitKind,
    INVALID_QOS_MONITORING_DATA, INVALID_THERMAL_HEADROOM,
};
