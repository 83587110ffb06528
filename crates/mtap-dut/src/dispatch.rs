//! Command dispatch
//!
//! Per request line:
//! 1. Parse; blank lines produce no reply
//! 2. Look the name up in the dispatch table (E_UNKNOWN_CMD)
//! 3. Validate arity and argument types (E_BAD_ARGS / E_OUT_OF_RANGE)
//! 4. Consult the fault injector, then run the device handler
//!
//! Device and fault state sit behind one mutex. The critical section covers
//! step 4 only and never includes a stall; stalled replies are held by the
//! session after the lock is released.

use std::collections::HashMap;
use std::panic::{self, AssertUnwindSafe};
use std::time::Duration;

use parking_lot::Mutex;
use serde_json::{json, Map};
use tracing::{debug, error, info};

use mtap_core::{Command, CommandName, FaultProfile, MtapResult, ProtocolError, Response};

use crate::device::object;
use crate::{
    validate_temp, DeviceDefaults, DeviceModel, DeviceState, FaultDecision, FaultInjector,
    FaultStats, FaultTuning, MarkovState,
};

/// A validated request, one variant per command
#[derive(Clone, Debug, PartialEq)]
pub enum Request {
    Ping { sn: String },
    ReadTemp { sn: String },
    SelfTest { sn: String },
    SetTemp { sn: String, temp_c: f64 },
    SetFaultProfile { profile: FaultProfile },
}

impl Request {
    pub fn kind(&self) -> CommandName {
        match self {
            Request::Ping { .. } => CommandName::Ping,
            Request::ReadTemp { .. } => CommandName::ReadTemp,
            Request::SelfTest { .. } => CommandName::SelfTest,
            Request::SetTemp { .. } => CommandName::SetTemp,
            Request::SetFaultProfile { .. } => CommandName::SetFaultProfile,
        }
    }

    /// Serial number the request is scoped to
    pub fn sn(&self) -> Option<&str> {
        match self {
            Request::Ping { sn }
            | Request::ReadTemp { sn }
            | Request::SelfTest { sn }
            | Request::SetTemp { sn, .. } => Some(sn),
            Request::SetFaultProfile { .. } => None,
        }
    }
}

type Decoder = fn(&[String]) -> MtapResult<Request>;

/// Dispatch table entry: argument schema plus decoder
#[derive(Clone, Copy)]
pub struct CommandSpec {
    pub name: CommandName,
    decode: Decoder,
}

impl CommandSpec {
    /// Check arity, then argument types
    pub fn validate(&self, args: &[String]) -> MtapResult<Request> {
        self.name.check_arity(args)?;
        (self.decode)(args)
    }
}

/// Fixed mapping from command name to its spec
pub struct DispatchTable {
    specs: HashMap<&'static str, CommandSpec>,
}

impl DispatchTable {
    /// The frozen v1 command set
    pub fn standard() -> Self {
        let specs = [
            CommandSpec {
                name: CommandName::Ping,
                decode: |a| Ok(Request::Ping { sn: a[0].clone() }),
            },
            CommandSpec {
                name: CommandName::ReadTemp,
                decode: |a| Ok(Request::ReadTemp { sn: a[0].clone() }),
            },
            CommandSpec {
                name: CommandName::SelfTest,
                decode: |a| Ok(Request::SelfTest { sn: a[0].clone() }),
            },
            CommandSpec {
                name: CommandName::SetTemp,
                decode: |a| {
                    Ok(Request::SetTemp {
                        sn: a[0].clone(),
                        temp_c: validate_temp(&a[1])?,
                    })
                },
            },
            CommandSpec {
                name: CommandName::SetFaultProfile,
                decode: |a| {
                    Ok(Request::SetFaultProfile {
                        profile: a[0].parse()?,
                    })
                },
            },
        ];

        DispatchTable {
            specs: specs.into_iter().map(|s| (s.name.as_str(), s)).collect(),
        }
    }

    pub fn lookup(&self, name: &str) -> Option<&CommandSpec> {
        self.specs.get(name)
    }

    pub fn len(&self) -> usize {
        self.specs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.specs.is_empty()
    }
}

/// A reply the session must hold before writing
#[derive(Clone, Debug, PartialEq)]
pub struct Stall {
    pub sn: String,
    pub delay: Duration,
}

/// Outcome of dispatching one line
#[derive(Clone, Debug, PartialEq)]
pub struct Reply {
    pub response: Response,
    pub stall: Option<Stall>,
}

impl Reply {
    fn immediate(response: Response) -> Self {
        Reply {
            response,
            stall: None,
        }
    }
}

struct SharedState {
    devices: DeviceModel,
    faults: FaultInjector,
}

/// Dispatcher shared by every session of one server
pub struct Dispatcher {
    table: DispatchTable,
    state: Mutex<SharedState>,
}

impl Dispatcher {
    pub fn new(profile: FaultProfile, tuning: FaultTuning, seed: u64, defaults: DeviceDefaults) -> Self {
        Dispatcher {
            table: DispatchTable::standard(),
            state: Mutex::new(SharedState {
                devices: DeviceModel::new(defaults),
                faults: FaultInjector::new(profile, tuning, seed),
            }),
        }
    }

    /// Handle one raw request line. `None` means no reply is due.
    pub fn dispatch_line(&self, line: &str) -> Option<Reply> {
        let command = Command::parse_line(line)?;
        Some(self.dispatch(&command))
    }

    /// Handle one parsed command
    pub fn dispatch(&self, command: &Command) -> Reply {
        let name = command.name();

        let Some(spec) = self.table.lookup(name) else {
            debug!(cmd = name, "unknown command");
            return Reply::immediate(
                ProtocolError::UnknownCommand(name.to_string())
                    .to_response()
                    .with_cmd(name),
            );
        };

        let request = match spec.validate(command.args()) {
            Ok(request) => request,
            Err(e) => {
                debug!(cmd = name, error = %e, "rejected arguments");
                return Reply::immediate(e.to_response().with_cmd(name));
            }
        };

        // Handler failures of any kind surface as E_INTERNAL
        match panic::catch_unwind(AssertUnwindSafe(|| self.execute(&request))) {
            Ok(mut reply) => {
                reply.response = reply.response.with_cmd(name);
                reply
            }
            Err(_) => {
                error!(cmd = name, "handler panicked");
                Reply::immediate(
                    ProtocolError::Internal("handler failure".into())
                        .to_response()
                        .with_cmd(name),
                )
            }
        }
    }

    /// Release a stall once its reply has been held long enough
    pub fn finish_stall(&self, stall: &Stall) {
        self.state.lock().devices.end_stall(&stall.sn);
    }

    fn execute(&self, request: &Request) -> Reply {
        let mut guard = self.state.lock();
        let state = &mut *guard;

        let sn = match request {
            Request::SetFaultProfile { profile } => {
                state.faults.set_profile(*profile);
                info!(profile = %profile, "fault profile set");
                return Reply::immediate(Response::ok(object(json!({ "profile": profile.as_str() }))));
            }
            other => match other.sn() {
                Some(sn) => sn,
                None => return Reply::immediate(ProtocolError::Internal("missing sn".into()).to_response()),
            },
        };

        match state.faults.evaluate() {
            FaultDecision::Fail { code, message } => Reply::immediate(Response::error(code, message)),
            FaultDecision::Pass => Reply::immediate(Self::run_handler(state, request)),
            FaultDecision::Delay(delay) => {
                let response = Self::run_handler(state, request);
                state.devices.begin_stall(sn);
                Reply {
                    response,
                    stall: Some(Stall {
                        sn: sn.to_string(),
                        delay,
                    }),
                }
            }
        }
    }

    fn run_handler(state: &mut SharedState, request: &Request) -> Response {
        let drift = state.faults.drift_step();
        let data = match request {
            Request::Ping { sn } => state.devices.ping(sn, drift),
            Request::ReadTemp { sn } => state.devices.read_temp(sn, drift),
            Request::SelfTest { sn } => {
                let forced_failure = state.faults.self_test_fails();
                state.devices.self_test(sn, drift, forced_failure)
            }
            Request::SetTemp { sn, temp_c } => state.devices.set_temp(sn, *temp_c, drift),
            Request::SetFaultProfile { .. } => Map::new(),
        };
        Response::ok(data)
    }

    /// Active fault profile
    pub fn profile(&self) -> FaultProfile {
        self.state.lock().faults.profile()
    }

    pub fn markov_state(&self) -> MarkovState {
        self.state.lock().faults.markov_state()
    }

    pub fn fault_stats(&self) -> FaultStats {
        self.state.lock().faults.stats().clone()
    }

    /// Copy of the state for `sn`, if it has been referenced
    pub fn device(&self, sn: &str) -> Option<DeviceState> {
        self.state.lock().devices.get(sn).cloned()
    }

    pub fn device_count(&self) -> usize {
        self.state.lock().devices.len()
    }

    /// Drop all units, restore the initial profile and reseed
    pub fn reset(&self) {
        let mut state = self.state.lock();
        state.devices.reset();
        state.faults.reset();
        info!("dut state reset");
    }
}
