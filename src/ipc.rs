//! Bounded FIFO over anonymous shared memory.
//!
//! For coordinating with helper processes that cannot share an in-process
//! channel: the region is mapped `MAP_SHARED` before `fork()`, and both
//! sides synchronize through process-shared pthread primitives living
//! inside the mapping. `T` must be plain bytes; the queue copies values in
//! and out of the ring.

use std::{io, marker::PhantomData, mem, ptr};

#[repr(C)]
struct Header {
    mutex: libc::pthread_mutex_t,
    not_empty: libc::pthread_cond_t,
    not_full: libc::pthread_cond_t,
    head: usize,
    len: usize,
}

pub struct SharedQueue<T: Copy> {
    shm: *mut u8,
    map_len: usize,
    capacity: usize,
    _marker: PhantomData<T>,
}

// The mapping is shared by design; all access goes through the pshared mutex.
unsafe impl<T: Copy + Send> Send for SharedQueue<T> {}
unsafe impl<T: Copy + Send> Sync for SharedQueue<T> {}

impl<T: Copy> SharedQueue<T> {
    pub fn new(capacity: usize) -> io::Result<Self> {
        assert!(capacity > 0, "queue capacity must be positive");
        let data_offset = Self::data_offset();
        let map_len = data_offset + capacity * mem::size_of::<T>();

        let shm = unsafe {
            libc::mmap(
                ptr::null_mut(),
                map_len,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED | libc::MAP_ANONYMOUS,
                -1,
                0,
            )
        };
        if shm == libc::MAP_FAILED {
            return Err(io::Error::last_os_error());
        }
        let shm = shm.cast::<u8>();

        unsafe {
            let header = shm.cast::<Header>();
            (*header).head = 0;
            (*header).len = 0;

            let mut mattr: libc::pthread_mutexattr_t = mem::zeroed();
            check(libc::pthread_mutexattr_init(&mut mattr))?;
            check(libc::pthread_mutexattr_setpshared(
                &mut mattr,
                libc::PTHREAD_PROCESS_SHARED,
            ))?;
            check(libc::pthread_mutex_init(&mut (*header).mutex, &mattr))?;
            libc::pthread_mutexattr_destroy(&mut mattr);

            let mut cattr: libc::pthread_condattr_t = mem::zeroed();
            check(libc::pthread_condattr_init(&mut cattr))?;
            check(libc::pthread_condattr_setpshared(
                &mut cattr,
                libc::PTHREAD_PROCESS_SHARED,
            ))?;
            check(libc::pthread_cond_init(&mut (*header).not_empty, &cattr))?;
            check(libc::pthread_cond_init(&mut (*header).not_full, &cattr))?;
            libc::pthread_condattr_destroy(&mut cattr);
        }

        Ok(Self {
            shm,
            map_len,
            capacity,
            _marker: PhantomData,
        })
    }

    fn data_offset() -> usize {
        let align = mem::align_of::<T>().max(1);
        mem::size_of::<Header>().div_ceil(align) * align
    }

    fn header(&self) -> *mut Header {
        self.shm.cast()
    }

    fn slot(&self, index: usize) -> *mut T {
        unsafe { self.shm.add(Self::data_offset()).cast::<T>().add(index) }
    }

    /// Append `value`, blocking while the queue is full.
    pub fn enqueue(&self, value: T) {
        let header = self.header();
        unsafe {
            libc::pthread_mutex_lock(&mut (*header).mutex);
            while (*header).len == self.capacity {
                libc::pthread_cond_wait(&mut (*header).not_full, &mut (*header).mutex);
            }
            let tail = ((*header).head + (*header).len) % self.capacity;
            self.slot(tail).write(value);
            (*header).len += 1;
            libc::pthread_cond_broadcast(&mut (*header).not_empty);
            libc::pthread_mutex_unlock(&mut (*header).mutex);
        }
    }

    /// Remove the oldest value, blocking while the queue is empty.
    pub fn dequeue(&self) -> T {
        let header = self.header();
        unsafe {
            libc::pthread_mutex_lock(&mut (*header).mutex);
            while (*header).len == 0 {
                libc::pthread_cond_wait(&mut (*header).not_empty, &mut (*header).mutex);
            }
            let value = self.slot((*header).head).read();
            (*header).head = ((*header).head + 1) % self.capacity;
            (*header).len -= 1;
            libc::pthread_cond_broadcast(&mut (*header).not_full);
            libc::pthread_mutex_unlock(&mut (*header).mutex);
            value
        }
    }
}

impl<T: Copy> Drop for SharedQueue<T> {
    fn drop(&mut self) {
        unsafe {
            libc::munmap(self.shm.cast(), self.map_len);
        }
    }
}

fn check(ret: libc::c_int) -> io::Result<()> {
    if ret == 0 {
        Ok(())
    } else {
        Err(io::Error::from_raw_os_error(ret))
    }
}

#[cfg(test)]
mod test {
    use super::SharedQueue;
    use std::sync::Arc;

    #[test]
    fn fifo_across_threads() {
        let queue = Arc::new(SharedQueue::<u64>::new(8).unwrap());
        let producer = {
            let queue = queue.clone();
            std::thread::spawn(move || {
                for i in 0..1000u64 {
                    queue.enqueue(i);
                }
            })
        };
        for expected in 0..1000u64 {
            assert_eq!(queue.dequeue(), expected);
        }
        producer.join().unwrap();
    }

    #[test]
    fn enqueue_blocks_at_capacity() {
        let queue = Arc::new(SharedQueue::<u8>::new(2).unwrap());
        queue.enqueue(1);
        queue.enqueue(2);

        let producer = {
            let queue = queue.clone();
            std::thread::spawn(move || {
                queue.enqueue(3);
                queue.enqueue(4);
            })
        };
        std::thread::sleep(std::time::Duration::from_millis(50));

        assert_eq!(queue.dequeue(), 1);
        assert_eq!(queue.dequeue(), 2);
        assert_eq!(queue.dequeue(), 3);
        assert_eq!(queue.dequeue(), 4);
        producer.join().unwrap();
    }

    #[test]
    fn survives_fork() {
        let requests = SharedQueue::<i32>::new(4).unwrap();
        let replies = SharedQueue::<i32>::new(4).unwrap();
        match unsafe { libc::fork() } {
            0 => {
                // child: echo one value back, incremented
                let value = requests.dequeue();
                replies.enqueue(value + 1);
                unsafe { libc::_exit(0) };
            }
            child if child > 0 => {
                requests.enqueue(41);
                assert_eq!(replies.dequeue(), 42);
                let mut status = 0;
                unsafe { libc::waitpid(child, &mut status, 0) };
            }
            _ => panic!("fork failed"),
        }
    }
}
