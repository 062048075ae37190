mod env;

pub use env::{Env, parse_dotenv};
