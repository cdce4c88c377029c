extern crate signaller;

use std::rc::Rc;

use signaller::{watch_async, Runtime, Signaller};


/// Example program, counting ticks with two signallers.
///
/// A ticker future bumps `ticks` every turn, and `parity` whenever it crosses an even tick.
/// A callback prints every flush of `ticks`, while an asynchronous watch over both signallers
/// takes two turns per invocation, and thus receives the changes made meanwhile as one batch.
fn main() -> anyhow::Result<()> {
  let runtime = Runtime::new();
  let handle  = runtime.handle();

  let ticks  = Signaller::new(&handle, 0u32);
  let parity = Signaller::always(&handle, true);

  let ticks_2 = ticks.clone();
  ticks.add_callback(Rc::new(move || println!("ticks flushed: {}", ticks_2.get())));

  let (ticks_3, parity_3, handle_3) = (ticks.clone(), parity.clone(), handle.clone());
  let _watch = watch_async([ticks.source(), parity.source()], move |changed| {
    let names: Vec<&str> = changed
      .iter()
      .map(|source| if source.is(&ticks_3) { "ticks" } else { "parity" })
      .collect();
    println!("watch invoked: {:?} (ticks = {}, even = {})", names, ticks_3.get(), parity_3.get());

    let handle = handle_3.clone();
    async move {
      handle.next_turn().await;
      handle.next_turn().await;
    }
  });

  let ticker = runtime.handle();
  runtime.block_on(async move {
    for _ in 0..6 {
      let tick = ticks.get() + 1;
      ticks.assign(tick)?;
      if tick % 2 == 0 {
        parity.set(true)?;
      }
      ticker.next_turn().await;
    }
    Ok::<(), signaller::Error>(())
  })??;

  runtime.execute()?;
  println!("done after {} turns", runtime.turn_count());
  Ok(())
}
