use serde::{Deserialize, Serialize};

/// Side-effect class of anything the responder can run: a diagnostic tool
/// call or a remediation action. Ordered by increasing severity.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Effect {
    /// Computes over its input only.
    Pure,
    /// Reads external state (metrics, logs, configuration). Idempotent.
    Observe,
    /// Changes external state in a way that re-applying the prior
    /// configuration reverses.
    Mutate,
    /// Cannot be undone.
    Irreversible,
}

impl Effect {
    /// Whether a defined reverse operation exists.
    pub fn reversible(&self) -> bool {
        matches!(self, Effect::Pure | Effect::Observe | Effect::Mutate)
    }

    /// Safe to repeat any number of times inside a tool-calling loop.
    pub fn side_effect_free(&self) -> bool {
        matches!(self, Effect::Pure | Effect::Observe)
    }
}

/// Anything with a classified effect.
pub trait Effectful {
    fn effect(&self) -> Effect;

    fn reversible(&self) -> bool {
        self.effect().reversible()
    }
}

/// True when every item can be reversed. Empty input is trivially reversible.
pub fn all_reversible<'a, T, I>(items: I) -> bool
where
    T: Effectful + 'a,
    I: IntoIterator<Item = &'a T>,
{
    items.into_iter().all(|item| item.reversible())
}
