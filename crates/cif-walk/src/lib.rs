//! Depth-first traversal of a CIF store.
//!
//! A [`CifHandler`] receives a callback at each structural boundary and
//! steers the walk through the [`Directive`] it returns. All callbacks are
//! optional: the defaults descend everywhere. Traversal is depth-first in
//! insertion order; packet cursors are re-opened per yield, so a handler may
//! mutate the CIF it is walking.

use cif_model::{Packet, Result, Value};
use cif_store::{Cif, Container, Loop};

/// What the walker should do after a callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Directive {
    /// Descend into this element's children.
    Continue,
    /// Do not descend; continue with the next sibling. Returned from a start
    /// callback this also suppresses the matching end callback.
    SkipCurrent,
    /// Finish the current element, then skip its remaining siblings.
    SkipSiblings,
    /// Terminate the entire walk, successfully.
    End,
}

pub type Step = Result<Directive>;

/// Handler invoked at each structural boundary of a CIF.
///
/// The same trait serves the store walker and the streaming parser: both
/// deliver events in document order, so a handler written for one works
/// against the other.
#[allow(unused_variables)]
pub trait CifHandler {
    fn cif_start(&mut self, cif: &Cif) -> Step {
        Ok(Directive::Continue)
    }
    fn cif_end(&mut self, cif: &Cif) -> Step {
        Ok(Directive::Continue)
    }
    fn block_start(&mut self, cif: &Cif, block: &Container) -> Step {
        Ok(Directive::Continue)
    }
    fn block_end(&mut self, cif: &Cif, block: &Container) -> Step {
        Ok(Directive::Continue)
    }
    fn frame_start(&mut self, cif: &Cif, frame: &Container) -> Step {
        Ok(Directive::Continue)
    }
    fn frame_end(&mut self, cif: &Cif, frame: &Container) -> Step {
        Ok(Directive::Continue)
    }
    fn loop_start(&mut self, cif: &Cif, lp: &Loop) -> Step {
        Ok(Directive::Continue)
    }
    fn loop_end(&mut self, cif: &Cif, lp: &Loop) -> Step {
        Ok(Directive::Continue)
    }
    fn packet_start(&mut self, cif: &Cif, packet: &Packet) -> Step {
        Ok(Directive::Continue)
    }
    fn packet_end(&mut self, cif: &Cif, packet: &Packet) -> Step {
        Ok(Directive::Continue)
    }
    /// `name` is `None` for a value with no attached data name (parser error
    /// recovery); such values are outside any loop.
    fn item(&mut self, cif: &Cif, name: Option<&str>, value: &Value) -> Step {
        Ok(Directive::Continue)
    }
}

/// Walk the whole store. Handler errors propagate verbatim; directives are
/// consumed by the traversal and never surface as errors.
pub fn walk(cif: &Cif, handler: &mut dyn CifHandler) -> Result<()> {
    match handler.cif_start(cif)? {
        Directive::Continue => {}
        // Valid responses instructing us to do nothing further.
        Directive::SkipCurrent | Directive::SkipSiblings | Directive::End => return Ok(()),
    }

    let blocks = cif.blocks()?;
    let mut handle_blocks = true;
    for block in &blocks {
        if handle_blocks {
            match walk_container(cif, block, 0, handler)? {
                Directive::Continue | Directive::SkipCurrent => {}
                Directive::SkipSiblings | Directive::End => handle_blocks = false,
            }
        }
    }

    // The end callback fires only when the block list was fully traversed.
    if handle_blocks {
        handler.cif_end(cif)?;
    }
    Ok(())
}

fn walk_container(
    cif: &Cif,
    container: &Container,
    depth: u32,
    handler: &mut dyn CifHandler,
) -> Step {
    let start = if depth > 0 {
        handler.frame_start(cif, container)?
    } else {
        handler.block_start(cif, container)?
    };
    if start != Directive::Continue {
        return Ok(start);
    }

    let frames = cif.frames(container)?;
    let mut handle_frames = true;
    let mut handle_loops = true;
    let mut last = Directive::Continue;
    for frame in &frames {
        if handle_frames {
            last = walk_container(cif, frame, depth + 1, handler)?;
            match last {
                Directive::Continue | Directive::SkipCurrent => {}
                Directive::End => {
                    handle_loops = false;
                    handle_frames = false;
                }
                Directive::SkipSiblings => handle_frames = false,
            }
        }
    }
    if !handle_loops {
        return Ok(last);
    }

    match walk_loops(cif, container, handler)? {
        Directive::Continue | Directive::SkipCurrent => {
            if depth > 0 {
                handler.frame_end(cif, container)
            } else {
                handler.block_end(cif, container)
            }
        }
        Directive::SkipSiblings => Ok(Directive::Continue),
        Directive::End => Ok(Directive::End),
    }
}

fn walk_loops(cif: &Cif, container: &Container, handler: &mut dyn CifHandler) -> Step {
    let mut result = Directive::Continue;
    for lp in cif.loops(container)? {
        result = walk_loop(cif, &lp, handler)?;
        match result {
            Directive::Continue | Directive::SkipCurrent => {}
            _ => break,
        }
    }
    Ok(result)
}

fn walk_loop(cif: &Cif, lp: &Loop, handler: &mut dyn CifHandler) -> Step {
    let start = handler.loop_start(cif, lp)?;
    if start != Directive::Continue {
        return Ok(start);
    }

    for packet in cif.packets(lp) {
        let packet = packet?;
        match walk_packet(cif, &packet, handler)? {
            Directive::Continue | Directive::SkipCurrent => continue,
            // Remaining packets are skipped; so is the loop's end callback.
            Directive::SkipSiblings => return Ok(Directive::Continue),
            Directive::End => return Ok(Directive::End),
        }
    }

    handler.loop_end(cif, lp)
}

fn walk_packet(cif: &Cif, packet: &Packet, handler: &mut dyn CifHandler) -> Step {
    let start = handler.packet_start(cif, packet)?;
    if start != Directive::Continue {
        return Ok(start);
    }

    for (_, entry) in packet.iter() {
        match handler.item(cif, Some(&entry.name_orig), &entry.value)? {
            Directive::Continue | Directive::SkipCurrent => {}
            Directive::SkipSiblings => return Ok(Directive::Continue),
            Directive::End => return Ok(Directive::End),
        }
    }

    handler.packet_end(cif, packet)
}
