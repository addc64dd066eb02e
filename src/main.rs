use std::env::args;

use eyre::Result;
use mramsim::main_inner;

fn main() -> Result<()> {
    main_inner(args())
}
