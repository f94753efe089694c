mod ringbuf;

pub use self::ringbuf::RingBuffer;
