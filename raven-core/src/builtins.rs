//! Builtin primitives reachable from scripts.
//!
//! Message dispatch falls back here after the receiver's blueprint chain
//! turns up nothing. The registry is a fixed symbol→builtin table built
//! once at engine startup; evaluation itself lives in the VM, which has
//! the heap and connection access the primitives need.

use crate::symbol::{Symbol, SymbolTable};
use std::collections::HashMap;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Builtin {
    /// `write(value)` — render a value to the fiber's connection.
    Write,
    /// `read_line()` — blocking: parks the fiber until a full line arrives.
    ReadLine,
    /// `find_object(path)` — resolve a virtual path to its singleton
    /// object, compiling the file on first reference.
    FindObject,
    /// `call(funcref, args…)` — invoke a funcref.
    Call,
    /// `len(value)` — length of a string, array or mapping.
    Len,
    /// `put(container, key, value)` — store into a mapping or array.
    Put,
    /// `this_path()` — virtual path of the file defining the running method.
    ThisPath,
    /// `disconnect()` — close the fiber's connection after output flushes.
    Disconnect,
}

impl Builtin {
    pub fn name(self) -> &'static str {
        match self {
            Builtin::Write => "write",
            Builtin::ReadLine => "read_line",
            Builtin::FindObject => "find_object",
            Builtin::Call => "call",
            Builtin::Len => "len",
            Builtin::Put => "put",
            Builtin::ThisPath => "this_path",
            Builtin::Disconnect => "disconnect",
        }
    }

    const ALL: [Builtin; 8] = [
        Builtin::Write,
        Builtin::ReadLine,
        Builtin::FindObject,
        Builtin::Call,
        Builtin::Len,
        Builtin::Put,
        Builtin::ThisPath,
        Builtin::Disconnect,
    ];
}

#[derive(Debug, Default)]
pub struct BuiltinRegistry {
    by_symbol: HashMap<Symbol, Builtin>,
}

impl BuiltinRegistry {
    /// Intern every builtin name and index the table.
    pub fn new(symbols: &mut SymbolTable) -> Self {
        let mut by_symbol = HashMap::new();
        for builtin in Builtin::ALL {
            by_symbol.insert(symbols.intern(builtin.name()), builtin);
        }
        Self { by_symbol }
    }

    pub fn lookup(&self, message: Symbol) -> Option<Builtin> {
        self.by_symbol.get(&message).copied()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registry_resolves_every_builtin() {
        let mut symbols = SymbolTable::new();
        let registry = BuiltinRegistry::new(&mut symbols);
        for builtin in Builtin::ALL {
            let sym = symbols.get(builtin.name()).unwrap();
            assert_eq!(registry.lookup(sym), Some(builtin));
        }
        let other = symbols.intern("definitely_not_a_builtin");
        assert_eq!(registry.lookup(other), None);
    }
}
