mod framed_stream;

pub use framed_stream::FramedUnixStream;
