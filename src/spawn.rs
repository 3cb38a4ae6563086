//! Child process attribute list
//!
//! Everything the child needs after `fork` (program path, argv, envp) is laid
//! out in the session arena beforehand, so the forked child only calls
//! `execve` with ready pointers and never allocates.

use std::ffi::{c_char, CStr};
use std::mem;
use std::os::unix::ffi::OsStrExt;
use std::ptr;

use crate::arena::{Arena, ArenaResult};

/// NUL-terminated argv/envp vectors living in an [`Arena`]
pub struct SpawnPlan<'a> {
    program: &'a CStr,
    argv: &'a [*const c_char],
    envp: &'a [*const c_char],
}

impl<'a> SpawnPlan<'a> {
    /// Lay out `<shell> -c <command>` with the inherited environment and `TERM=<term>`
    pub fn build(arena: &'a Arena, shell: &str, command: &str, term: &str) -> ArenaResult<Self> {
        let program = arena.strdup(shell.as_bytes())?;
        let args = [
            program,
            arena.strdup(b"-c")?,
            arena.strdup(command.as_bytes())?,
        ];

        let mut env = Vec::new();
        for (key, value) in std::env::vars_os() {
            if key.as_bytes() == b"TERM" {
                continue;
            }
            env.push(arena.strcat(&[key.as_bytes(), b"=", value.as_bytes()])?);
        }
        env.push(arena.strcat(&[b"TERM=", term.as_bytes()])?);

        Ok(Self {
            program,
            argv: pointer_array(arena, &args)?,
            envp: pointer_array(arena, &env)?,
        })
    }

    /// Path passed to `execve`
    pub fn program(&self) -> &'a CStr {
        self.program
    }

    pub fn argv_ptr(&self) -> *const *const c_char {
        self.argv.as_ptr()
    }

    pub fn envp_ptr(&self) -> *const *const c_char {
        self.envp.as_ptr()
    }

    /// Arguments, excluding the terminating null
    pub fn args(&self) -> impl Iterator<Item = &'a CStr> + '_ {
        entries(self.argv)
    }

    /// Environment entries as `KEY=VALUE`, excluding the terminating null
    pub fn env(&self) -> impl Iterator<Item = &'a CStr> + '_ {
        entries(self.envp)
    }
}

/// Copy string pointers into a null-terminated array inside the arena
fn pointer_array<'a>(arena: &'a Arena, items: &[&'a CStr]) -> ArenaResult<&'a [*const c_char]> {
    let len = items.len() + 1;
    let base = arena
        .calloc(len, mem::size_of::<*const c_char>())?
        .cast::<*const c_char>();

    // SAFETY: calloc returned `len` zeroed, 8-byte aligned pointer slots, and
    // the arena keeps them alive for 'a
    unsafe {
        for (i, item) in items.iter().enumerate() {
            ptr::write(base.as_ptr().add(i), item.as_ptr());
        }
        Ok(std::slice::from_raw_parts(base.as_ptr(), len))
    }
}

fn entries<'a>(array: &'a [*const c_char]) -> impl Iterator<Item = &'a CStr> + 'a {
    array
        .iter()
        .take_while(|p| !p.is_null())
        // SAFETY: every non-null slot points at a NUL-terminated arena string
        .map(|&p| unsafe { CStr::from_ptr(p) })
}
