fn main() {
    switchyard::run();
}
