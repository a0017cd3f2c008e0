use std::{
    net::UdpSocket,
    os::unix::io::AsRawFd,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    thread,
    time::Duration,
};

use reactor_core::{Condition, TaskScheduler};
use tracing_subscriber::EnvFilter;

fn main() -> reactor_core::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let mut scheduler = TaskScheduler::new()?;
    let done = Arc::new(AtomicBool::new(false));

    for ms in [500, 100, 300] {
        scheduler.schedule_delayed_task(ms * 1_000, move |_| tracing::info!(ms, "delayed task fired"));
    }

    let socket = UdpSocket::bind("127.0.0.1:0")?;
    socket.set_nonblocking(true)?;
    let addr = socket.local_addr()?;
    let fd = socket.as_raw_fd();
    scheduler.set_background_handling(fd, Condition::READABLE, move |_, conditions| {
        let mut buf = [0u8; 512];
        while let Ok((n, from)) = socket.recv_from(&mut buf) {
            tracing::info!(?conditions, %from, bytes = n, "datagram received");
        }
    });

    let trigger = scheduler.create_event_trigger(|scheduler, data| {
        let message = data
            .as_deref()
            .and_then(|d| d.downcast_ref::<String>())
            .cloned()
            .unwrap_or_default();
        tracing::info!(%message, pending = scheduler.pending_tasks(), "trigger serviced");
    });

    let handle = scheduler.trigger_handle();
    let worker = thread::spawn(move || -> std::io::Result<()> {
        thread::sleep(Duration::from_millis(200));
        handle.trigger_event(trigger, Some(Arc::new(String::from("hello from a worker"))));

        let sender = UdpSocket::bind("127.0.0.1:0")?;
        sender.send_to(b"ping", addr)?;
        Ok(())
    });

    let flag = done.clone();
    scheduler.schedule_delayed_task(700_000, move |_| {
        tracing::info!("stopping");
        flag.store(true, Ordering::Release);
    });

    scheduler.do_event_loop(Some(&*done))?;

    match worker.join() {
        Ok(result) => result?,
        Err(_) => tracing::error!("worker thread panicked"),
    }
    Ok(())
}
