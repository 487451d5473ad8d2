/*!
`reagent` is a runtime for declarative concurrency in the join-calculus
style: concurrent computation is expressed as *reactions* that atomically
consume multisets of typed *molecules* from per-site bags and may emit new
ones. Whenever the molecules present at a site satisfy some reaction's
input patterns (including value conditionals and cross-molecule guards),
the site's scheduler commits that reaction and runs its body on a thread
pool, much like chemical rewriting.

Molecules are emitted through typed handles: [`Molecule<T>`] for
fire-and-forget messages and [`BlockingMolecule<T, R>`] for synchronous
request/response, where the emitting thread parks until a consuming
reaction replies (or an optional timeout elapses). Reactions are declared
with [`Reaction`] and compiled into a [`site`](site()) together with the
pools that run them; construction statically analyzes the declared
chemistry and rejects shadowed reactions, unavoidable livelocks and
malformed static-molecule declarations.

```
use reagent::{molecule, blocking_molecule, site, InputPattern, Reaction, ReactionPool};

let pool = ReactionPool::new("counter", None);
let c = molecule::<i32>("c");
let d = molecule::<()>("d");
let g = blocking_molecule::<(), i32>("g");

let decrement = {
    let c2 = c.clone();
    Reaction::new(move |inputs| {
        let n: i32 = inputs.cloned(0)?;
        c2.emit(n - 1)?;
        Ok(())
    })
    .consumes(&c, InputPattern::var("n"))
    .consumes(&d, InputPattern::wildcard())
    .emits(&c)
};
let report = Reaction::new(|inputs| inputs.reply(1, 0i32))
    .consumes(&c, InputPattern::constant(0i32))
    .consumes(&g, InputPattern::wildcard());

let _site = site(&pool, [decrement, report]).unwrap();
c.emit(2).unwrap();
d.emit(()).unwrap();
d.emit(()).unwrap();
assert_eq!(g.emit(()).unwrap(), 0);
```
*/

mod analyzer;
mod bag;
mod error;
mod matcher;
mod molecule;
mod pattern;
mod pool;
mod reaction;
mod reply;
mod site;
mod value;


pub use error::{ConfigError, EmitError, ErrorLog, ReactionFailure};
pub use molecule::{blocking_molecule, molecule, BlockingMolecule, Molecule, MoleculeRef};
pub use pattern::{CrossGuard, InputPattern, OutputPattern, ReactionGuard};
pub use pool::ReactionPool;
pub use reaction::{BodyError, Reaction, ReactionInfo, ReactionInputs};
pub use site::{site, SiteBuilder, SiteHandle};
pub use value::{MolData, MolValue};
