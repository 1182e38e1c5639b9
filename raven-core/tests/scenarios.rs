//! End-to-end behavior: compile real files from a host tree, run fibers
//! through the engine, observe script-visible results.

use raven_core::engine::Engine;
use raven_core::lang::CompileLog;
use raven_core::{EngineConfig, Value};

fn world(files: &[(&str, &str)]) -> (Engine, tempfile::TempDir) {
    let dir = tempfile::tempdir().unwrap();
    for (name, source) in files {
        let path = dir.path().join(name);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).unwrap();
        }
        std::fs::write(path, source).unwrap();
    }
    let config = EngineConfig {
        anchor: dir.path().to_path_buf(),
        master: "/master".to_string(),
        ..EngineConfig::default()
    };
    let mut engine = Engine::new(config);
    engine.load_world().unwrap();
    (engine, dir)
}

fn object_at(engine: &mut Engine, path: &str) -> Value {
    let file = engine.vfs().resolve(engine.vfs().root(), path).unwrap();
    Value::Obj(engine.file_object(file).expect("file should compile"))
}

fn as_str(engine: &Engine, v: Value) -> String {
    let r = v.as_obj().expect("expected a string value");
    engine.heap().str_(r).expect("expected a string value").to_string()
}

#[test]
fn arithmetic_returns_five() {
    let (mut engine, _dir) = world(&[("calc", "int f() { return 2 + 3; }")]);
    let obj = object_at(&mut engine, "/calc");
    assert_eq!(engine.call_method(obj, "f").unwrap(), Value::Int(5));
}

#[test]
fn dispatch_prefers_child_and_super_reaches_parent() {
    let (mut engine, _dir) = world(&[
        ("std/a", "string greet() { return \"a\"; }"),
        (
            "std/b",
            "inherit \"/std/a\";\n\
             string greet() { return \"b\"; }\n\
             string parent_greet() { return super.greet(); }\n",
        ),
    ]);
    let b = object_at(&mut engine, "/std/b");
    let got = engine.call_method(b, "greet").unwrap();
    assert_eq!(as_str(&engine, got), "b");
    let got = engine.call_method(b, "parent_greet").unwrap();
    assert_eq!(as_str(&engine, got), "a");
}

#[test]
fn while_loop_with_break_counts_to_three() {
    let (mut engine, _dir) = world(&[(
        "counter",
        "int f() {\n\
             int i = 0;\n\
             while (1) {\n\
                 i = i + 1;\n\
                 if (i == 3) break;\n\
             }\n\
             return i;\n\
         }\n",
    )]);
    let obj = object_at(&mut engine, "/counter");
    assert_eq!(engine.call_method(obj, "f").unwrap(), Value::Int(3));
}

#[test]
fn for_loop_and_continue() {
    let (mut engine, _dir) = world(&[(
        "sums",
        "int f() {\n\
             int total = 0;\n\
             for (int i = 0; i < 10; i = i + 1) {\n\
                 if (i % 2) continue;\n\
                 total = total + i;\n\
             }\n\
             return total;\n\
         }\n",
    )]);
    let obj = object_at(&mut engine, "/sums");
    // 0 + 2 + 4 + 6 + 8
    assert_eq!(engine.call_method(obj, "f").unwrap(), Value::Int(20));
}

#[test]
fn member_initializers_and_create_run_at_instantiation() {
    let (mut engine, _dir) = world(&[(
        "mob",
        "int hp = 100;\n\
         int boosted;\n\
         void create() { boosted = hp + 1; }\n\
         int get() { return boosted; }\n",
    )]);
    let obj = object_at(&mut engine, "/mob");
    assert_eq!(engine.call_method(obj, "get").unwrap(), Value::Int(101));
}

#[test]
fn inherited_members_share_the_slot_layout() {
    let (mut engine, _dir) = world(&[
        ("base", "int a = 1;\nint base_a() { return a; }"),
        (
            "derived",
            "inherit \"/base\";\n\
             int b = 2;\n\
             int sum() { a = a + 10; return a + b; }\n",
        ),
    ]);
    let obj = object_at(&mut engine, "/derived");
    assert_eq!(engine.call_method(obj, "sum").unwrap(), Value::Int(13));
    assert_eq!(engine.call_method(obj, "base_a").unwrap(), Value::Int(11));
}

#[test]
fn funcrefs_invoke_through_call() {
    let (mut engine, _dir) = world(&[(
        "fr",
        "int three() { return 3; }\n\
         int go() { return call(&three) + 1; }\n",
    )]);
    let obj = object_at(&mut engine, "/fr");
    assert_eq!(engine.call_method(obj, "go").unwrap(), Value::Int(4));
}

#[test]
fn arrays_and_mappings_round_trip() {
    let (mut engine, _dir) = world(&[(
        "coll",
        "int maps() {\n\
             mapping m = [\"a\": 1, \"b\": 2];\n\
             put(m, \"a\", 5);\n\
             return m[\"a\"] + len(m);\n\
         }\n\
         int arrays() {\n\
             mixed xs = [1, 2, 3];\n\
             put(xs, 0, 9);\n\
             return xs[0] + xs[2] + len(xs);\n\
         }\n\
         any missing() { mapping m = [:]; return m[\"nope\"]; }\n",
    )]);
    let obj = object_at(&mut engine, "/coll");
    assert_eq!(engine.call_method(obj, "maps").unwrap(), Value::Int(7));
    assert_eq!(engine.call_method(obj, "arrays").unwrap(), Value::Int(15));
    assert_eq!(engine.call_method(obj, "missing").unwrap(), Value::Nil);
}

#[test]
fn varargs_collect_surplus_arguments() {
    let (mut engine, _dir) = world(&[(
        "va",
        "int sum(...) {\n\
             int total = 0;\n\
             for (int i = 0; i < len(args); i = i + 1) total = total + args[i];\n\
             return total;\n\
         }\n\
         int go() { return sum(1, 2, 3); }\n",
    )]);
    let obj = object_at(&mut engine, "/va");
    assert_eq!(engine.call_method(obj, "go").unwrap(), Value::Int(6));
}

#[test]
fn this_path_names_the_defining_file() {
    let (mut engine, _dir) = world(&[("deep/thing", "string where() { return this_path(); }")]);
    let obj = object_at(&mut engine, "/deep/thing");
    let got = engine.call_method(obj, "where").unwrap();
    assert_eq!(as_str(&engine, got), "/deep/thing");
}

#[test]
fn find_object_resolves_relative_to_the_caller() {
    let (mut engine, _dir) = world(&[
        ("lib/alpha", "string tag() { return \"alpha\"; }"),
        (
            "lib/beta",
            "string peek() {\n\
                 object o = find_object(\"../alpha\");\n\
                 return o.tag();\n\
             }\n",
        ),
    ]);
    let obj = object_at(&mut engine, "/lib/beta");
    let got = engine.call_method(obj, "peek").unwrap();
    assert_eq!(as_str(&engine, got), "alpha");
}

#[test]
fn compiling_twice_is_observationally_equivalent() {
    let (mut engine, _dir) = world(&[("calc", "int f() { return 40 + 2; }")]);
    let file = engine.vfs().resolve(engine.vfs().root(), "/calc").unwrap();

    let first = object_at(&mut engine, "/calc");
    assert_eq!(engine.call_method(first, "f").unwrap(), Value::Int(42));

    let mut log = CompileLog::new();
    assert!(engine.file_recompile(file, &mut log));
    assert!(log.is_empty());

    let second = object_at(&mut engine, "/calc");
    assert_eq!(engine.call_method(second, "f").unwrap(), Value::Int(42));
}

#[test]
fn canonical_paths_survive_resolution() {
    let (engine, _dir) = world(&[("lib/std/obj", "int x;")]);
    let vfs = engine.vfs();
    for path in ["/lib", "/lib/std", "/lib/std/obj"] {
        let node = vfs.resolve(vfs.root(), path).unwrap();
        assert_eq!(vfs.path_of(node), path);
    }
    let std_node = vfs.resolve(vfs.root(), "/lib/std").unwrap();
    assert_eq!(
        vfs.resolve(std_node, "../std/obj"),
        vfs.resolve(vfs.root(), "/lib/std/obj")
    );
}

#[test]
fn two_connections_echo_independently() {
    let (mut engine, _dir) = world(&[(
        "master",
        "void login() {\n\
             while (true) {\n\
                 string line = read_line();\n\
                 write(line + \"\\n\");\n\
             }\n\
         }\n",
    )]);

    let a = engine.attach_connection("a".to_string()).unwrap();
    let b = engine.attach_connection("b".to_string()).unwrap();
    engine.run_until_idle();
    assert!(engine.drain_output().is_empty());

    // Interleaved partial arrivals; neither fiber may starve the other.
    engine.connection_input(a, b"first ");
    engine.connection_input(b, b"second");
    engine.run_until_idle();
    assert!(engine.drain_output().is_empty());

    engine.connection_input(b, b" line\n");
    engine.run_until_idle();
    engine.connection_input(a, b"line\nextra\n");
    engine.run_until_idle();

    let mut out = engine.drain_output();
    out.sort_by_key(|(id, _)| *id == b);
    assert_eq!(out[0].0, a);
    assert_eq!(String::from_utf8_lossy(&out[0].1), "first line\nextra\n");
    assert_eq!(out[1].0, b);
    assert_eq!(String::from_utf8_lossy(&out[1].1), "second line\n");

    // EOF cancels the parked fiber and the connection closes.
    engine.connection_eof(a);
    engine.run_until_idle();
    assert_eq!(engine.take_closed(), vec![a]);
    assert_eq!(engine.inspect().connections.len(), 1);
}

#[test]
fn faults_do_not_leak_fibers() {
    let (mut engine, _dir) = world(&[(
        "master",
        "void login() { string s = read_line(); write(s[99]); }",
    )]);
    let conn = engine.attach_connection("p".to_string()).unwrap();
    engine.run_until_idle();
    engine.connection_input(conn, b"hi\n");
    engine.run_until_idle();

    let out = engine.drain_output();
    assert!(String::from_utf8_lossy(&out[0].1).contains("out of bounds"));
    engine.take_closed();
    assert!(engine.inspect().fibers.is_empty());
    assert!(engine.inspect().connections.is_empty());
}
