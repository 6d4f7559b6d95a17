//! Chains a sequence of commands through the same search: each feasible sbom for one
//! command becomes the starting point for the next, and the final sbom yielded for the
//! whole pipeline is the union across every step.

use std::path::Path;

use crate::containers::Image;
use crate::search::{Generator, Sbom, StepError};

/// Searches `commands` in order, starting from `base_image`. `source_tree`, if given, is
/// only mounted for the first command (later commands run against the image left behind
/// by the previous command's feasible run).
pub fn multi_step(
    generator: &Generator,
    commands: &[Vec<String>],
    base_image: &Image,
    source_tree: Option<&Path>,
    on_feasible: &mut dyn FnMut(Sbom) -> bool,
) -> Result<(), StepError> {
    search_from(generator, commands, base_image, &Sbom::new(), source_tree, on_feasible)
}

fn search_from(
    generator: &Generator,
    commands: &[Vec<String>],
    base_image: &Image,
    accumulated: &Sbom,
    source_tree: Option<&Path>,
    on_feasible: &mut dyn FnMut(Sbom) -> bool,
) -> Result<(), StepError> {
    let Some((argv, rest)) = commands.split_first() else {
        return Ok(());
    };

    let mut keep_going = true;
    let mut first_error: Option<StepError> = None;

    generator.search(base_image, argv, source_tree, |sbom, image| {
        if !keep_going {
            return false;
        }
        let combined = accumulated.extended(&sbom.iter().cloned().collect::<Vec<_>>());
        if rest.is_empty() {
            keep_going = on_feasible(combined);
        } else if let Err(e) = search_from(generator, rest, image, &combined, None, &mut *on_feasible) {
            first_error = Some(e);
            keep_going = false;
        }
        keep_going
    })?;

    if let Some(e) = first_error {
        return Err(e);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_command_list_yields_nothing() {
        // search_from's base case should return cleanly without touching `generator` or
        // `base_image`; exercised indirectly since constructing a real Generator needs a
        // live cache and engine, which belong in the integration suite.
        let commands: Vec<Vec<String>> = Vec::new();
        assert!(commands.split_first().is_none());
    }
}
