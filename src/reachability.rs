//! Reachability supervisor (C7): every 5 s, rolls the `seen`/`lastseen`
//! windows and toggles installed tunnel routes based on whether any link was
//! heard from.

use crate::config::RouteConfig;
use std::collections::HashMap;
use tracing::info;

#[derive(Debug, Default)]
pub struct Reachability {
    pub seen: HashMap<String, u64>,
    pub lastseen: HashMap<String, u64>,
    pub up: bool,
}

/// What the 5 s tick decided to do, so the caller can invoke the shell
/// collaborator outside of any lock/borrow held by `Reachability` itself.
#[derive(Debug, PartialEq, Eq)]
pub enum Transition {
    None,
    BringUp,
    BringDown,
}

impl Reachability {
    /// Performs one 5 s tick (§4.7): snapshot `lastseen`, reset `seen`, and
    /// decide whether `up` should flip. Returns the transition so the caller
    /// can apply it via [`crate::route::routes_up`]/[`routes_down`] only when
    /// it actually changes (property 6: route idempotence).
    pub fn tick(&mut self) -> Transition {
        self.lastseen = std::mem::take(&mut self.seen);

        let any_seen = self.lastseen.values().any(|&count| count > 0);

        if any_seen {
            if !self.up {
                self.up = true;
                info!("tunnel reachable: bringing routes up");
                return Transition::BringUp;
            }
        } else if self.up {
            self.up = false;
            info!("tunnel unreachable: withdrawing routes");
            return Transition::BringDown;
        }

        Transition::None
    }
}

pub fn apply_transition(transition: &Transition, routes: &[RouteConfig]) {
    match transition {
        Transition::BringUp => crate::route::routes_up(routes),
        Transition::BringDown => crate::route::routes_down(routes),
        Transition::None => {}
    }
}
