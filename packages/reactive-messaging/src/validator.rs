//! Checks host injection points against the wired graph.

use std::fmt;

use tracing::error;

use crate::error::DeploymentProblem;
use crate::registry::ChannelRegistry;

/// What the host injects at an injection point.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InjectionKind {
    /// A stream of the channel.
    Channel,
    /// An emitter feeding the channel.
    Emitter,
}

/// A place in the host that expects a channel or emitter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InjectionPoint {
    /// What is injected.
    pub kind: InjectionKind,
    /// Channel name.
    pub channel: String,
    /// Human-readable location, e.g. `Dashboard::feed`.
    pub description: String,
}

impl InjectionPoint {
    /// A channel stream injected at `description`.
    pub fn channel(channel: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            kind: InjectionKind::Channel,
            channel: channel.into(),
            description: description.into(),
        }
    }

    /// An emitter injected at `description`.
    pub fn emitter(channel: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            kind: InjectionKind::Emitter,
            channel: channel.into(),
            description: description.into(),
        }
    }
}

impl fmt::Display for InjectionPoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.description, self.channel)
    }
}

/// Every problem with the injection points, each under its own kind.
///
/// A channel reference must name a channel something produces; an emitter
/// reference must name an emitter whose channel was subscribed.
pub fn validate(registry: &ChannelRegistry, points: &[InjectionPoint]) -> Vec<DeploymentProblem> {
    let incoming = registry.incoming_names();
    let mut problems = Vec::new();

    for point in points {
        let problem = match point.kind {
            InjectionKind::Channel if !incoming.contains(&point.channel) => {
                Some(DeploymentProblem::UnresolvedIncoming {
                    channel: point.channel.clone(),
                    injection_point: Some(point.description.clone()),
                })
            }
            InjectionKind::Emitter
                if !registry
                    .emitter(&point.channel)
                    .is_some_and(|emitter| emitter.is_connected()) =>
            {
                Some(DeploymentProblem::EmitterNotConnected {
                    channel: point.channel.clone(),
                    injection_point: point.description.clone(),
                })
            }
            _ => None,
        };
        if let Some(problem) = problem {
            error!(kind = problem.kind(), injection_point = %point, "{problem}");
            problems.push(problem);
        }
    }

    problems
}
