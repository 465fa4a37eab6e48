use anyhow::Result;
use declarative::ModuleDescriptor;

fn main() -> Result<()> {
    let registry = convoy::modules::builtin()?;
    convoy::run(std::env::args_os(), &registry, Vec::<ModuleDescriptor>::new())
}
