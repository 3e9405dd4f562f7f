pub mod function;

pub use function::{AgentInfo, FunctionModel};
