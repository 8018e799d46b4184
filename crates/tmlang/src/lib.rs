// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! A TextMate-grammar syntax highlighting engine.
//!
//! ## Architecture
//!
//!   grammar JSON
//! → `rules` (deserialize) → rule tree
//! → `compile` → [`grammar::Grammar`] (patterns + state graph)
//! → `render` (per-line state machine) → sorted scope markers
//! → `highlight` (walk markers) → begin/end scope events + text
//!
//! The state graph is cyclic (`$self`/`$base` includes), so states and
//! patterns live in arenas inside [`grammar::Grammar`] and reference each
//! other through `u32` handles. Renderers borrow the grammar read-only;
//! any number of them can run over distinct documents in parallel.
//!
//! ## Regex semantics
//!
//! Everything is delegated to Oniguruma via the `onig` crate. Two things the
//! binding doesn't expose are layered on top in `regex`:
//!
//! - `ONIG_OPTION_NOT_BEGIN_POSITION`: patterns containing `\G` get a second
//!   compiled variant with the anchor replaced by a never-matching assertion.
//! - `onig_regset_search` with position-lead semantics: emulated by searching
//!   every pattern of a state and keeping the leftmost match (lowest pattern
//!   index on ties).
//!
//! ## Gotchas
//!
//! - A scope name is a plain `u32`; `0` means "no scope" and such ranges are
//!   dropped at emission. Interning is the caller's problem (`compile` does it
//!   for grammars loaded through [`highlight::Highlighter`]).
//! - `end`/`while` patterns may contain `\N` backreferences into their begin
//!   match. Those are recompiled per stack frame at match time, with every
//!   captured byte rewritten as an octal escape so regex metacharacters in
//!   the captured text stay inert.
//! - Nothing here is fatal: bad pushes are dropped, zero-width match loops
//!   abort after 32 iterations, backreference failures degrade to "no match".

pub mod compile;
pub mod grammar;
pub mod highlight;
pub mod regex;
pub mod render;
pub mod rules;
