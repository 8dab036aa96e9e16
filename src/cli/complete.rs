//! Hidden completion helper called by shell completion scripts.

use super::Context;
use clap::{Args, ValueEnum};
use vmctl::completion::{self, CompletionTarget};

/// Kind of name to complete.
#[derive(ValueEnum, Debug, Clone, Copy)]
pub enum Kind {
    Machines,
    Connections,
}

impl From<Kind> for CompletionTarget {
    fn from(kind: Kind) -> Self {
        match kind {
            Kind::Machines => CompletionTarget::Machines,
            Kind::Connections => CompletionTarget::Connections,
        }
    }
}

/// Print names matching a prefix, one per line
#[derive(Args, Debug)]
pub struct CompleteCmd {
    /// What to complete.
    #[arg(value_enum)]
    pub kind: Kind,

    /// Prefix typed so far.
    #[arg(default_value = "")]
    pub prefix: String,
}

impl CompleteCmd {
    /// Never fails: any error yields no suggestions.
    pub fn run(self, ctx: &Context) -> vmctl::Result<()> {
        let names = match ctx.manager() {
            Ok(manager) => completion::complete(&manager, self.kind.into(), &self.prefix),
            Err(e) => completion::or_empty(Err(e)),
        };
        for name in names {
            println!("{}", name);
        }
        Ok(())
    }
}
