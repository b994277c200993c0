mod sim;

mod channels;
mod netlink;
mod stream;
