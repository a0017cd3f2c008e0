//! The platform wait primitive the scheduler drives each step.

use std::{io, sync::Arc, time::Duration};

use crate::handler_set::{Condition, Socket};

/// Wakes a blocked [`Poller::wait`] from another thread.
pub trait Notify: Send + Sync {
    fn notify(&self) -> io::Result<()>;
}

impl Notify for mio::Waker {
    fn notify(&self) -> io::Result<()> {
        self.wake()
    }
}

/// Blocks until a socket of interest is ready or `timeout` passes.
pub trait Poller {
    /// `interests` is the full current registration set; sockets absent from
    /// it must no longer be reported. Ready sockets are appended to `ready`.
    fn wait(
        &mut self,
        interests: &[(Socket, Condition)],
        timeout: Duration,
        ready: &mut Vec<(Socket, Condition)>,
    ) -> io::Result<()>;

    /// Used by triggers fired off the reactor thread.
    fn notifier(&self) -> Option<Arc<dyn Notify>> {
        None
    }
}

#[cfg(unix)]
pub use self::unix::MioPoller;

#[cfg(unix)]
mod unix {
    use std::{io, os::unix::io::RawFd, sync::Arc, time::Duration};

    use mio::{unix::SourceFd, Events, Interest, Poll, Registry, Token, Waker};

    use super::{Notify, Poller};
    use crate::{
        hash_table::HashTable,
        handler_set::{Condition, Socket},
    };

    const WAKER_TOKEN: Token = Token(usize::MAX);

    /// [`Poller`] over `mio::Poll`.
    ///
    /// mio reports readiness edges. To give handlers the level-triggered
    /// behaviour they expect, every socket of interest is re-armed before
    /// each wait, which makes the OS report it again if it is still ready.
    /// Re-arming also notices a socket that was closed and reopened under the
    /// same number, since the OS dropped the old registration on close.
    pub struct MioPoller {
        poll: Poll,
        events: Events,
        waker: Arc<Waker>,
        // socket -> generation of the last wait that wanted it
        registered: HashTable<usize, u64>,
        generation: u64,
    }

    impl MioPoller {
        pub fn new(events_capacity: usize) -> io::Result<Self> {
            let poll = Poll::new()?;
            let waker = Arc::new(Waker::new(poll.registry(), WAKER_TOKEN)?);
            Ok(Self {
                poll,
                events: Events::with_capacity(events_capacity),
                waker,
                registered: HashTable::new(),
                generation: 0,
            })
        }

        /// Bring the OS registrations in line with `interests`.
        fn sync(&mut self, interests: &[(Socket, Condition)]) -> io::Result<()> {
            self.generation += 1;
            let registry = self.poll.registry();

            for &(socket, conditions) in interests {
                let Some(interest) = interest_for(conditions) else {
                    continue;
                };
                let key = socket as usize;
                match self.registered.lookup_mut(&key) {
                    Some(generation) => {
                        arm(registry, socket, interest, true)?;
                        *generation = self.generation;
                    }
                    None => {
                        arm(registry, socket, interest, false)?;
                        tracing::trace!(socket, ?interest, "socket registered");
                        self.registered.add(key, self.generation);
                    }
                }
            }

            let stale: Vec<usize> = self
                .registered
                .iter()
                .filter(|&(_, &generation)| generation != self.generation)
                .map(|(&key, _)| key)
                .collect();
            for key in stale {
                self.registered.remove(&key);
                let fd = key as RawFd;
                // the socket may already be closed, which drops it from the
                // OS set on its own
                if let Err(err) = registry.deregister(&mut SourceFd(&fd)) {
                    tracing::trace!(socket = fd, %err, "deregister failed");
                } else {
                    tracing::trace!(socket = fd, "socket deregistered");
                }
            }
            Ok(())
        }
    }

    /// Register or re-register `socket`, whichever the OS currently needs.
    fn arm(registry: &Registry, socket: Socket, interest: Interest, known: bool) -> io::Result<()> {
        let fd: RawFd = socket;
        let token = Token(socket as usize);
        let result = if known {
            registry.reregister(&mut SourceFd(&fd), token, interest)
        } else {
            registry.register(&mut SourceFd(&fd), token, interest)
        };
        match result {
            Err(err) if known && err.kind() == io::ErrorKind::NotFound => {
                tracing::trace!(socket, "registration lost, registering again");
                registry.register(&mut SourceFd(&fd), token, interest)
            }
            Err(err) if !known && err.kind() == io::ErrorKind::AlreadyExists => {
                registry.reregister(&mut SourceFd(&fd), token, interest)
            }
            other => other,
        }
    }

    impl Poller for MioPoller {
        fn wait(
            &mut self,
            interests: &[(Socket, Condition)],
            timeout: Duration,
            ready: &mut Vec<(Socket, Condition)>,
        ) -> io::Result<()> {
            self.sync(interests)?;

            match self.poll.poll(&mut self.events, Some(timeout)) {
                Ok(()) => {}
                Err(err) if err.kind() == io::ErrorKind::Interrupted => return Ok(()),
                Err(err) => return Err(err),
            }

            for event in &self.events {
                if event.token() == WAKER_TOKEN {
                    continue;
                }
                let socket = event.token().0 as Socket;
                let mut conditions = Condition::NONE;
                if event.is_readable() || event.is_read_closed() {
                    conditions |= Condition::READABLE;
                }
                if event.is_writable() || event.is_write_closed() {
                    conditions |= Condition::WRITABLE;
                }
                if event.is_error() || event.is_priority() {
                    conditions |= Condition::EXCEPTION;
                }
                ready.push((socket, conditions));
            }
            Ok(())
        }

        fn notifier(&self) -> Option<Arc<dyn Notify>> {
            Some(self.waker.clone())
        }
    }

    /// mio cannot register an empty interest. Exception-only interest is
    /// watched as readable, since errors are reported with any interest.
    fn interest_for(conditions: Condition) -> Option<Interest> {
        let mut interest: Option<Interest> = None;
        let mut add = |extra: Interest| {
            interest = Some(match interest {
                Some(existing) => existing | extra,
                None => extra,
            });
        };
        if conditions.is_readable() || conditions.is_exception() {
            add(Interest::READABLE);
        }
        if conditions.is_writable() {
            add(Interest::WRITABLE);
        }
        interest
    }

    #[cfg(test)]
    mod tests {
        use super::*;
        use std::{net::UdpSocket, os::unix::io::AsRawFd};

        #[test]
        fn interest_mapping() {
            assert_eq!(interest_for(Condition::NONE), None);
            assert_eq!(interest_for(Condition::READABLE), Some(Interest::READABLE));
            assert_eq!(interest_for(Condition::EXCEPTION), Some(Interest::READABLE));
            assert_eq!(
                interest_for(Condition::READABLE | Condition::WRITABLE),
                Some(Interest::READABLE | Interest::WRITABLE)
            );
        }

        #[test]
        fn reports_readable_udp_socket_until_drained() {
            let receiver = UdpSocket::bind("127.0.0.1:0").unwrap();
            receiver.set_nonblocking(true).unwrap();
            let sender = UdpSocket::bind("127.0.0.1:0").unwrap();
            sender.send_to(b"ping", receiver.local_addr().unwrap()).unwrap();

            let socket = receiver.as_raw_fd();
            let interests = [(socket, Condition::READABLE)];
            let mut poller = MioPoller::new(16).unwrap();
            let mut ready = Vec::new();

            poller
                .wait(&interests, Duration::from_secs(2), &mut ready)
                .unwrap();
            assert_eq!(ready, vec![(socket, Condition::READABLE)]);

            // not drained: reported again
            ready.clear();
            poller
                .wait(&interests, Duration::from_secs(2), &mut ready)
                .unwrap();
            assert_eq!(ready, vec![(socket, Condition::READABLE)]);

            let mut buf = [0u8; 16];
            assert_eq!(receiver.recv(&mut buf).unwrap(), 4);
            ready.clear();
            poller
                .wait(&interests, Duration::from_millis(20), &mut ready)
                .unwrap();
            assert!(ready.is_empty());
        }

        #[test]
        fn dropped_interest_is_not_reported() {
            let receiver = UdpSocket::bind("127.0.0.1:0").unwrap();
            let sender = UdpSocket::bind("127.0.0.1:0").unwrap();
            let socket = receiver.as_raw_fd();
            let mut poller = MioPoller::new(16).unwrap();
            let mut ready = Vec::new();

            poller
                .wait(&[(socket, Condition::READABLE)], Duration::ZERO, &mut ready)
                .unwrap();
            assert!(ready.is_empty());

            sender.send_to(b"ping", receiver.local_addr().unwrap()).unwrap();
            poller
                .wait(&[], Duration::from_millis(20), &mut ready)
                .unwrap();
            assert!(ready.is_empty());
        }

        /// Bind UDP sockets until one lands on `fd`. Sockets that miss are
        /// held so the OS moves on to other numbers.
        fn bind_on_fd(fd: RawFd) -> Option<UdpSocket> {
            let mut misses = Vec::new();
            for _ in 0..64 {
                let socket = UdpSocket::bind("127.0.0.1:0").unwrap();
                if socket.as_raw_fd() == fd {
                    return Some(socket);
                }
                misses.push(socket);
                std::thread::sleep(Duration::from_millis(1));
            }
            None
        }

        #[test]
        fn reopened_socket_on_the_same_fd_is_reported() {
            let first = UdpSocket::bind("127.0.0.1:0").unwrap();
            let socket = first.as_raw_fd();
            let interests = [(socket, Condition::READABLE)];
            let mut poller = MioPoller::new(16).unwrap();
            let mut ready = Vec::new();

            poller.wait(&interests, Duration::ZERO, &mut ready).unwrap();
            assert!(ready.is_empty());

            drop(first);
            // another test thread may hold the number for now
            let Some(second) = bind_on_fd(socket) else {
                return;
            };
            let sender = UdpSocket::bind("127.0.0.1:0").unwrap();
            sender.send_to(b"ping", second.local_addr().unwrap()).unwrap();

            poller
                .wait(&interests, Duration::from_millis(200), &mut ready)
                .unwrap();
            assert_eq!(ready, vec![(socket, Condition::READABLE)]);
        }

        #[test]
        fn notifier_interrupts_wait() {
            let mut poller = MioPoller::new(16).unwrap();
            let notifier = poller.notifier().unwrap();
            let t = std::thread::spawn(move || {
                std::thread::sleep(Duration::from_millis(20));
                notifier.notify().unwrap();
            });

            let start = std::time::Instant::now();
            let mut ready = Vec::new();
            poller
                .wait(&[], Duration::from_secs(10), &mut ready)
                .unwrap();
            assert!(start.elapsed() < Duration::from_secs(5));
            assert!(ready.is_empty());
            t.join().unwrap();
        }
    }
}
