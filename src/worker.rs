use crate::{exit_status::ExitStatus, sandbox, trampoline::WorkerContext, util};
use nix::sys::signal::Signal;
use std::{
    io::{self, Write},
    panic::{self, AssertUnwindSafe},
};

/// Entry point of the worker process, started by the trampoline on the
/// pre-allocated stack. Terminates explicitly on every path: the returned
/// value is the process exit code.
pub(crate) fn main(ctx: &WorkerContext) -> isize {
    let _ = util::set_process_name(&format!("worker:{}", ctx.request.process_label));
    // The controller is our parent. Die with it.
    let _ = util::set_parent_death_signal(Signal::SIGKILL);

    if let Err(e) = sandbox::enter(ctx) {
        // Depending on how far sandboxing got this lands either on the
        // fork-server's stderr or in the captured pipe.
        let _ = writeln!(io::stderr(), "worker sandbox setup failed: {e:#}");
        return ExitStatus::SANDBOX_FAILED as isize;
    }

    // Run the entry function. This is what it's all about. An error or panic
    // here is probably a developer error; the trace on the captured stderr is
    // exactly what the developer needs to see.
    let result = panic::catch_unwind(AssertUnwindSafe(|| (ctx.entry)(&ctx.request.args)));

    let code = match result {
        Ok(Ok(())) => ExitStatus::SUCCESS,
        Ok(Err(error)) => {
            let _ = writeln!(io::stderr(), "{error:?}");
            ExitStatus::ENTRY_FAILED
        }
        Err(payload) => {
            // The panic hook writes wherever the inherited process state
            // points it, which is not necessarily the redirected stderr.
            // Report the payload on the captured stream ourselves.
            let message = payload
                .downcast_ref::<&str>()
                .copied()
                .or_else(|| payload.downcast_ref::<String>().map(String::as_str))
                .unwrap_or("non-string panic payload");
            let _ = writeln!(io::stderr(), "worker panicked: {message}");
            ExitStatus::ENTRY_FAILED
        }
    };

    let _ = io::stdout().flush();
    let _ = io::stderr().flush();

    code as isize
}
