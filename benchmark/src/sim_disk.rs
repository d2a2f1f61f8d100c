//! A [`dsched::Disk`] that serves requests on a fixed number of device
//! threads, each request taking a fixed service time.

use std::{
    sync::{
        atomic::{AtomicU64, Ordering},
        mpsc, Arc, Mutex,
    },
    time::Duration,
};

use dsched::{DiskCallback, Request};
use tracing::{debug, info_span};

enum Job {
    Scheduled(Request, DiskCallback),
    Raw(Request),
}

pub struct SimDisk {
    name: String,
    jobs: Mutex<Option<mpsc::Sender<Job>>>,
    workers: Mutex<Vec<std::thread::JoinHandle<()>>>,
    pub raw_served: AtomicU64,
}

impl SimDisk {
    pub fn new(name: &str, depth: usize, service_time: Duration) -> Arc<Self> {
        let (tx, rx) = mpsc::channel::<Job>();
        let rx = Arc::new(Mutex::new(rx));
        let disk = Arc::new(SimDisk {
            name: name.to_owned(),
            jobs: Mutex::new(Some(tx)),
            workers: Mutex::new(Vec::new()),
            raw_served: AtomicU64::new(0),
        });
        let workers = (0..depth)
            .map(|slot| {
                let rx = Arc::clone(&rx);
                let name = name.to_owned();
                std::thread::Builder::new()
                    .name(format!("{name}-dev-{slot}"))
                    .spawn(move || {
                        let span = info_span!("sim_disk", disk = %name, slot);
                        let _entered = span.enter();
                        loop {
                            let job = rx.lock().unwrap().recv();
                            let Ok(job) = job else {
                                debug!("device slot exiting");
                                break;
                            };
                            std::thread::sleep(service_time);
                            match job {
                                Job::Scheduled(request, done) => done(request, Ok(())),
                                Job::Raw(request) => request.complete(Ok(())),
                            }
                        }
                    })
                    .unwrap()
            })
            .collect();
        *disk.workers.lock().unwrap() = workers;
        disk
    }

    fn push(&self, job: Job) {
        let jobs = self.jobs.lock().unwrap();
        let tx = jobs.as_ref().expect("disk used after shutdown");
        if tx.send(job).is_err() {
            panic!("device threads gone");
        }
    }

    /// Finish the queued jobs and join the device threads.
    pub fn shutdown(&self) {
        drop(self.jobs.lock().unwrap().take());
        for worker in self.workers.lock().unwrap().drain(..) {
            worker.join().unwrap();
        }
    }
}

impl dsched::Disk for SimDisk {
    fn name(&self) -> &str {
        &self.name
    }

    fn accept_async(&self, request: Request, done: DiskCallback) {
        self.push(Job::Scheduled(request, done));
    }

    fn submit_raw(&self, request: Request) {
        self.raw_served.fetch_add(1, Ordering::Relaxed);
        self.push(Job::Raw(request));
    }
}
