#![forbid(unsafe_code)]

use slate_ast::{FunctionDecl, Module};

use crate::resolve::TypeUniverse;
use crate::types::FunctionId;

/// A declaration set that passed [`crate::Checker`]. Only checked programs
/// are handed to the interpreter.
#[derive(Clone, Debug)]
pub struct CheckedProgram {
    universe: TypeUniverse,
    modules: Vec<Module>,
}

impl CheckedProgram {
    pub(crate) fn new(universe: TypeUniverse, modules: Vec<Module>) -> Self {
        Self { universe, modules }
    }

    pub fn universe(&self) -> &TypeUniverse {
        &self.universe
    }

    pub fn modules(&self) -> &[Module] {
        &self.modules
    }

    pub fn module(&self, name: &str) -> Option<&Module> {
        self.modules.iter().find(|m| m.name == name)
    }

    pub fn function(&self, id: &FunctionId) -> Option<&FunctionDecl> {
        self.module(&id.module)?.function(&id.name)
    }

    /// Functions carrying annotation `attribute`, in declaration order.
    pub fn functions_with_attribute(&self, attribute: &str) -> Vec<FunctionId> {
        self.modules
            .iter()
            .flat_map(|m| {
                m.functions
                    .iter()
                    .filter(|f| f.has_attribute(attribute))
                    .map(move |f| FunctionId::new(&m.name, &f.name))
            })
            .collect()
    }
}
