//! Output plugins. Each one only sees events whose tag matches its `match` pattern.

use crate::event::Event;
use crate::tag::TagMatcher;

pub mod counter;
pub mod file;
pub mod stdout;

pub use counter::CounterOutput;
pub use file::FileOutput;
pub use stdout::StdoutOutput;

fn default_match() -> String {
    "*".to_string()
}

fn matching<'a>(matcher: &'a TagMatcher, events: &'a [Event]) -> impl Iterator<Item = &'a Event> {
    events
        .iter()
        .filter(move |event| matcher.matches(&event.metadata.tag))
}
